#[cfg(test)]
mod tests {
    use dsync::config::{Config, ProfileConfig, RepoConfig};
    use dsync::dataset::{Dataset, Meta};
    use dsync::resolver::{JsonWorkingDir, WorkingDir};
    use dsync::{DatasetResolver, Error, Profile, Repo};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config_at(dir: &TempDir) -> Config {
        Config {
            profile: ProfileConfig {
                username: "alice".to_string(),
                id: "QmAlice".to_string(),
            },
            repo: RepoConfig {
                path: Some(dir.path().join("repo")),
                cache_file: None,
            },
            ..Default::default()
        }
    }

    fn titled(title: &str, body: &str) -> Dataset {
        Dataset {
            meta: Some(Meta {
                title: title.to_string(),
                ..Default::default()
            }),
            body: Some(body.as_bytes().to_vec()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_me_resolves_to_default_username() -> anyhow::Result<()> {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        repo.save("foo", titled("Foo", "[1,2]")).await?;
        let resolver = DatasetResolver::for_repo(&repo);

        let (me_ref, me_info) = resolver.resolve("me/foo")?;
        let (alice_ref, alice_info) = resolver.resolve("alice/foo")?;
        assert_eq!(me_info, alice_info);
        assert_eq!(me_ref, alice_ref);
        assert_eq!(me_ref.username, "alice");
        assert_eq!(me_ref.profile_id, "QmAlice");

        let loaded = resolver.load_ref("me/foo")?;
        assert_eq!(loaded.dataset.peername, "alice");
        assert_eq!(loaded.dataset.title(), "Foo");
        assert_eq!(loaded.init_id, alice_info.init_id);
        assert_eq!(loaded.reference.path, alice_info.path);

        Ok(())
    }

    #[tokio::test]
    async fn test_me_without_username_is_unknown() -> anyhow::Result<()> {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        repo.save("foo", titled("Foo", "[1]")).await?;
        let resolver = DatasetResolver::new(Arc::clone(repo.cache()), Arc::clone(repo.store()), "");

        let err = resolver.resolve("me/foo").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "unknown username \"me\"");

        Ok(())
    }

    #[tokio::test]
    async fn test_not_found_messages() -> anyhow::Result<()> {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        repo.save("foo", titled("Foo", "[1]")).await?;
        let resolver = DatasetResolver::for_repo(&repo);

        let err = resolver.resolve("bob/foo").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "unknown username \"bob\"");

        let err = resolver.resolve("alice/bar").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "dataset ref not found alice/bar");

        assert!(matches!(
            resolver.resolve("not a ref").unwrap_err(),
            Error::InvalidArgument(_)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_bad_case_name_still_resolves() -> anyhow::Result<()> {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        repo.save("Cities", titled("Cities", "[1]")).await?;
        let loaded = DatasetResolver::for_repo(&repo).load_ref("alice/Cities")?;
        assert_eq!(loaded.dataset.name, "Cities");
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_path_loads_older_version() -> anyhow::Result<()> {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let first = repo.save("foo", titled("first", "[1]")).await?;
        repo.save("foo", titled("second", "[1,2]")).await?;
        let resolver = DatasetResolver::for_repo(&repo);

        let head = resolver.load_ref("alice/foo")?;
        assert_eq!(head.dataset.title(), "second");

        let old = resolver.load_ref(&format!("alice/foo@{}", first.path.unwrap()))?;
        assert_eq!(old.dataset.title(), "first");
        assert_eq!(old.dataset.path, first.path);
        assert_eq!(old.info.num_versions, 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_linked_working_dir_takes_precedence() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let checkout = tmp.path().join("foo");
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let saved = repo.save("foo", titled("committed", "[1]")).await?;

        JsonWorkingDir.write_dir(&checkout, &titled("draft", "[1,2,3]"))?;
        repo.link(&saved, Some(checkout.clone())).await?;

        let resolver = DatasetResolver::for_repo(&repo);
        let loaded = resolver.load_ref("alice/foo")?;
        assert_eq!(loaded.dataset.title(), "draft");
        assert_eq!(loaded.dataset.body.as_deref(), Some(&b"[1,2,3]"[..]));
        assert_eq!(loaded.dataset.path, saved.path);

        // an explicit version always comes from the store
        let pinned = resolver.load_ref(&format!("alice/foo@{}", saved.path.unwrap()))?;
        assert_eq!(pinned.dataset.title(), "committed");

        // a vanished checkout is reported, not papered over
        fs::remove_dir_all(&checkout)?;
        assert!(resolver.load_ref("alice/foo").unwrap_err().is_not_found());

        Ok(())
    }

    #[tokio::test]
    async fn test_cache_survives_reopen_and_corruption() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let config = config_at(&tmp);
        {
            let repo = Repo::open(&config)?;
            repo.save("foo", titled("Foo", "[1]")).await?;
            repo.save("foo", titled("Foo", "[1,2]")).await?;
        }
        let cache_file = config.cache_path();
        assert!(cache_file.is_file());

        let reopened = Repo::open(&config)?;
        let info = reopened.cache().resolve_by_name("alice", "foo")?;
        assert_eq!(info.num_versions, 2);
        drop(reopened);

        fs::write(&cache_file, b"garbage")?;
        let rebuilt = Repo::open(&config)?;
        assert_eq!(rebuilt.cache().resolve_by_name("alice", "foo")?, info);

        fs::remove_file(&cache_file)?;
        let rebuilt = Repo::open(&config)?;
        assert_eq!(rebuilt.cache().resolve_by_name("alice", "foo")?, info);

        Ok(())
    }
}
