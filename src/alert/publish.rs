//! Evidence publishing.
//!
//! Publishers take a JPEG and return a URL the relay can embed in the alert.
//! A failed publish degrades the alert to `image = null`; it never blocks it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use thiserror::Error;

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_RAW: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("evidence publishing is disabled")]
    Disabled,
    #[error("image host rejected upload with status {0}")]
    Rejected(u16),
    #[error("image host unreachable: {0}")]
    Transport(String),
}

pub trait EvidencePublisher: Send {
    fn name(&self) -> &'static str;

    /// Publish a JPEG and return its URL.
    fn publish(&mut self, jpeg: &[u8]) -> Result<String, PublishError>;
}

/// Embeds the image in the alert as a `data:` URL.
#[derive(Debug, Default)]
pub struct InlinePublisher;

impl EvidencePublisher for InlinePublisher {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn publish(&mut self, jpeg: &[u8]) -> Result<String, PublishError> {
        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
    }
}

/// Alerts go out without an image.
#[derive(Debug, Default)]
pub struct NoPublisher;

impl EvidencePublisher for NoPublisher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn publish(&mut self, _jpeg: &[u8]) -> Result<String, PublishError> {
        Err(PublishError::Disabled)
    }
}

/// Commits each image to a GitHub repository through the contents API and
/// returns the raw download URL.
pub struct GithubPublisher {
    agent: ureq::Agent,
    token: String,
    owner: String,
    repo: String,
    branch: String,
    folder: String,
    uploads: u64,
}

impl GithubPublisher {
    pub fn new(
        token: String,
        owner: String,
        repo: String,
        branch: String,
        folder: String,
        timeout: Duration,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            token,
            owner,
            repo,
            branch,
            folder: folder.trim_matches('/').to_string(),
            uploads: 0,
        }
    }

    /// `deteccion_<local timestamp>_<n>.jpg`; the counter keeps names unique when
    /// several groups alert within one second.
    fn file_name(&mut self) -> String {
        self.uploads += 1;
        format!(
            "deteccion_{}_{}.jpg",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            self.uploads
        )
    }

    fn path(&self, file_name: &str) -> String {
        if self.folder.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.folder, file_name)
        }
    }

    fn contents_url(&self, file_name: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            GITHUB_API,
            self.owner,
            self.repo,
            self.path(file_name)
        )
    }

    fn raw_url(&self, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            GITHUB_RAW,
            self.owner,
            self.repo,
            self.branch,
            self.path(file_name)
        )
    }
}

impl EvidencePublisher for GithubPublisher {
    fn name(&self) -> &'static str {
        "github"
    }

    fn publish(&mut self, jpeg: &[u8]) -> Result<String, PublishError> {
        let file_name = self.file_name();
        let body = serde_json::json!({
            "message": format!("Evidence {}", file_name),
            "content": STANDARD.encode(jpeg),
            "branch": self.branch,
        });
        self.agent
            .put(&self.contents_url(&file_name))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/vnd.github+json")
            .send_json(body)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => PublishError::Rejected(code),
                ureq::Error::Transport(transport) => PublishError::Transport(transport.to_string()),
            })?;
        log::debug!("evidence committed as {}", file_name);
        Ok(self.raw_url(&file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github(folder: &str) -> GithubPublisher {
        GithubPublisher::new(
            "token".to_string(),
            "field-team".to_string(),
            "evidence".to_string(),
            "main".to_string(),
            folder.to_string(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn inline_publisher_builds_data_url() {
        let url = InlinePublisher.publish(&[0xff, 0xd8, 0xff]).unwrap();
        assert_eq!(url, "data:image/jpeg;base64,/9j/");
    }

    #[test]
    fn disabled_publisher_fails() {
        assert!(matches!(
            NoPublisher.publish(&[1, 2, 3]),
            Err(PublishError::Disabled)
        ));
    }

    #[test]
    fn github_urls_share_the_committed_path() {
        let mut publisher = github("/capturas/");
        let name = publisher.file_name();
        assert!(name.starts_with("deteccion_"));
        assert!(name.ends_with("_1.jpg"));
        assert_eq!(
            publisher.contents_url(&name),
            format!(
                "https://api.github.com/repos/field-team/evidence/contents/capturas/{}",
                name
            )
        );
        assert_eq!(
            publisher.raw_url(&name),
            format!(
                "https://raw.githubusercontent.com/field-team/evidence/main/capturas/{}",
                name
            )
        );
    }

    #[test]
    fn github_file_names_are_unique() {
        let mut publisher = github("");
        let first = publisher.file_name();
        let second = publisher.file_name();
        assert_ne!(first, second);
        assert_eq!(publisher.path(&first), first);
    }
}
