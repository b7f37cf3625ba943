use std::{
    io,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::UnixListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::observation::ObservationWindow;

/// Parse one `<username> <ip>` line from the collector.
fn parse_sighting(line: &str) -> Option<(&str, IpAddr)> {
    let mut fields = line.split_whitespace();
    let username = fields.next()?;
    let ip = fields.next()?.parse().ok()?;

    if fields.next().is_some() {
        return None;
    }

    Some((username, ip))
}

/// Unix socket the external collector streams IP sightings into.
#[derive(Debug)]
pub(crate) struct IngestListener {
    path: PathBuf,
    listener: UnixListener,
}

impl IngestListener {
    /// Replaces a stale socket left behind by a previous run.
    #[instrument]
    pub(crate) fn bind(path: &Path) -> anyhow::Result<Self> {
        if let Err(err) = std::fs::remove_file(path)
            && err.kind() != io::ErrorKind::NotFound
        {
            return Err(err).with_context(|| {
                format!("Failed to remove ingest socket at path {}", path.display())
            });
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to create ingest socket at path {}", path.display()))?;

        std::fs::set_permissions(path, PermissionsExt::from_mode(0o660)).with_context(|| {
            format!("Failed to set permissions on ingest socket at path {}", path.display())
        })?;

        info!("Listening for IP sightings");

        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub(crate) async fn run(self, window: Arc<ObservationWindow>, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(?err, "Failed to accept incoming ingest connection");
                        continue;
                    }
                },
            };

            let window = Arc::clone(&window);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    result = read_sightings(stream, &window) => {
                        if let Err(err) = result {
                            debug!(?err, "Ingest connection closed with error");
                        }
                    }
                }
            });
        }

        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(?err, "Failed to remove ingest socket");
        }
    }
}

/// Record every valid sighting read from `stream`. Returns the number recorded.
async fn read_sightings<R>(stream: R, window: &ObservationWindow) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut recorded = 0;

    while let Some(line) = lines.next_line().await? {
        let Some((username, ip)) = parse_sighting(&line) else {
            debug!(%line, "Ignoring malformed sighting");
            continue;
        };

        trace!(username, %ip, "Sighting");
        window.record(username, &ip.to_string()).await;
        recorded += 1;
    }

    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::UnixStream};

    use super::*;

    #[test]
    fn parses_sighting_lines() {
        assert_eq!(
            parse_sighting("alice 10.0.0.1"),
            Some(("alice", "10.0.0.1".parse().unwrap()))
        );
        assert_eq!(
            parse_sighting("  bob\t2001:db8::1 "),
            Some(("bob", "2001:db8::1".parse().unwrap()))
        );
        assert_eq!(parse_sighting("alice"), None);
        assert_eq!(parse_sighting("alice not-an-ip"), None);
        assert_eq!(parse_sighting("alice 10.0.0.1 extra"), None);
        assert_eq!(parse_sighting(""), None);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let window = ObservationWindow::new();
        let input: &[u8] = b"alice 10.0.0.1\ngarbage\nalice 10.0.0.1\nalice 10.0.0.1\n";

        let recorded = read_sightings(input, &window).await.unwrap();

        assert_eq!(recorded, 3);
        let reports = window.drain(None).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "alice");
    }

    #[tokio::test]
    async fn socket_feeds_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.sock");
        std::fs::write(&path, "stale").unwrap();

        let window = Arc::new(ObservationWindow::new());
        let cancel = CancellationToken::new();
        let listener = IngestListener::bind(&path).unwrap();
        let server = tokio::spawn(listener.run(Arc::clone(&window), cancel.clone()));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(b"bob 10.0.0.7\nbob 10.0.0.7\nbob 10.0.0.7\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let reports = window.drain(None).await;

        cancel.cancel();
        server.await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "bob");
        assert!(!path.exists());
    }
}
