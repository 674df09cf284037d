//! HTTP tracker protocol

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, trace};

use super::response::{parse_announce_response, parse_scrape_response};
use super::{AnnounceRequest, AnnounceResponse, ScrapeStats};
use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// One HTTP(S) tracker
#[derive(Debug, Clone)]
pub struct HttpTracker {
    url: String,
    client: Client,
}

impl HttpTracker {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self { url: url.into(), client }
    }

    /// Build a client with the tracker request timeout
    pub fn client(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TorrentError::network_error_full("Failed to build HTTP client", "tracker", e.to_string()).into())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn separator(url: &str) -> char {
        if url.contains('?') {
            '&'
        } else {
            '?'
        }
    }

    /// Announce URL with binary fields percent-encoded byte by byte
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.url,
            Self::separator(&self.url),
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.num_want,
        );
        if let Some(event) = request.event.as_param() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    /// `.../announce` becomes `.../scrape`; trackers without that path cannot scrape
    pub fn scrape_url(&self, hashes: &[InfoHash]) -> Option<String> {
        let (path, query) = match self.url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.url.as_str(), None),
        };
        let (base, last) = path.rsplit_once('/')?;
        let rest = last.strip_prefix("announce")?;

        let mut url = format!("{}/scrape{}", base, rest);
        let mut separator = '?';
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
            separator = '&';
        }
        for hash in hashes {
            url.push(separator);
            url.push_str("info_hash=");
            url.push_str(&urlencoding::encode_binary(hash.as_bytes()));
            separator = '&';
        }
        Some(url)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        trace!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Tracker request failed", &self.url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_full(
                "Tracker returned error status",
                &self.url,
                status.to_string(),
            )
            .into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Failed to read tracker body", &self.url, e.to_string()))?;
        Ok(body.to_vec())
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let body = self.get(&self.announce_url(request)).await?;
        let response = parse_announce_response(&body, &self.url)?;
        debug!(
            "Tracker {} returned {} peers, interval {}s",
            self.url,
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }

    pub async fn scrape(&self, hashes: &[InfoHash]) -> Result<HashMap<InfoHash, ScrapeStats>> {
        let url = self
            .scrape_url(hashes)
            .ok_or_else(|| TorrentError::tracker_error("Tracker does not support scrape", &self.url))?;
        let body = self.get(&url).await?;
        parse_scrape_response(&body, &self.url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP reply and hand back the request line
    pub(crate) async fn serve_once(body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
            stream.shutdown().await.unwrap();
            let text = String::from_utf8_lossy(&request).into_owned();
            text.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://{}/announce", addr), handle)
    }

    fn request() -> AnnounceRequest {
        let mut request = AnnounceRequest::new(InfoHash([0xab; 20]), *b"-BE0100-abcdefghijkl", 6881);
        request.left = 100;
        request.event = AnnounceEvent::Started;
        request
    }

    #[test]
    fn test_announce_url_encoding() {
        let tracker = HttpTracker::new("http://t.example/announce?key=1", Client::new());
        let url = tracker.announce_url(&request());
        assert!(url.starts_with("http://t.example/announce?key=1&info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=-BE0100-abcdefghijkl&port=6881"));
        assert!(url.contains("&left=100&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_scrape_url() {
        let tracker = HttpTracker::new("http://t.example/x/announce.php?k=2", Client::new());
        assert_eq!(
            tracker.scrape_url(&[InfoHash([1; 20])]).unwrap(),
            format!("http://t.example/x/scrape.php?k=2&info_hash={}", "%01".repeat(20))
        );
        let tracker = HttpTracker::new("http://t.example/a", Client::new());
        assert!(tracker.scrape_url(&[]).is_none());
    }

    #[tokio::test]
    async fn test_announce_against_local_server() {
        let mut body = b"d8:intervali120e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let (url, server) = serve_once(body).await;

        let tracker = HttpTracker::new(url, HttpTracker::client(Duration::from_secs(5)).unwrap());
        let response = tracker.announce(&request()).await.unwrap();
        assert_eq!(response.interval, 120);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let line = server.await.unwrap();
        assert!(line.starts_with("GET /announce?info_hash=%AB"));
    }
}
