#[cfg(test)]
mod tests {
    use dsync::config::{Config, ProfileConfig, RepoConfig};
    use dsync::dataset::Dataset;
    use dsync::remote::{PeerSyncClient, ProcessPeer, SyncClient};
    use dsync::{Profile, Repo};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_peer_config(dir: &Path) -> anyhow::Result<Config> {
        let config = Config {
            profile: ProfileConfig {
                username: "bob".to_string(),
                id: "QmBob".to_string(),
            },
            repo: RepoConfig {
                path: Some(dir.to_path_buf()),
                cache_file: None,
            },
            ..Default::default()
        };
        fs::create_dir_all(dir)?;
        fs::write(dir.join("config.toml"), toml::to_string(&config)?)?;
        Ok(config)
    }

    #[tokio::test]
    async fn test_push_to_server_process() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let peer_dir = temp.path().join("bob");
        let config = write_peer_config(&peer_dir)?;

        let src = Arc::new(Repo::in_memory(Profile::new("alice", "QmAlice")));
        let saved = src
            .save(
                "cities",
                Dataset {
                    body: Some(b"[{\"name\":\"lisbon\"}]".to_vec()),
                    ..Default::default()
                },
            )
            .await?;
        src.set_published(&saved, true).await?;

        let transport = ProcessPeer::with_program(env!("CARGO_BIN_EXE_dsync"), &peer_dir);
        let client = PeerSyncClient::new(Arc::clone(&src), transport).with_compression(true);
        let done = client.add_dataset("alice/cities").await?;
        assert_eq!(done.head, saved.path);

        // each request runs a fresh server process against the same directory
        let feeds = client.feeds().await?;
        assert_eq!(feeds["recent"].len(), 0);
        let preview = client.preview("alice/cities").await?;
        assert_eq!(preview.path, saved.path);

        let peer = Repo::open(&config)?;
        let info = peer.cache().resolve_by_name("alice", "cities")?;
        assert_eq!(info.path, saved.path);
        assert!(info.foreign);

        Ok(())
    }
}
