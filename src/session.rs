//! Last.fm session key storage and the interactive login flow

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::lastfm::LastFmClient;

/// Read the persisted session key. A missing or blank file means no session.
pub fn load_session_key(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let key = content.trim();
            Ok((!key.is_empty()).then(|| key.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading session file {}", path.display())),
    }
}

/// Write the session key, readable by the owner only
pub fn persist_session_key(path: &Path, key: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("opening session file {}", path.display()))?;
    file.write_all(key.as_bytes())
        .with_context(|| format!("writing session file {}", path.display()))?;
    Ok(())
}

/// Authorize this client with Last.fm on stdin/stdout and store the session.
pub async fn login(path: &Path, client: &LastFmClient) -> Result<bool> {
    login_with(
        path,
        client,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Returns `Ok(false)` when the user does not confirm the approval.
pub async fn login_with<R, W>(path: &Path, client: &LastFmClient, mut input: R, mut output: W) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let token = client
        .get_token()
        .await
        .context("requesting Last.fm auth token")?;
    let prompt = format!(
        "Please approve the Last.fm API client at {}\nThen type 'yes' followed by return to continue: ",
        client.approval_url(&token)
    );
    output.write_all(prompt.as_bytes()).await?;
    output.flush().await?;

    let mut answer = String::new();
    input.read_line(&mut answer).await?;
    if answer.trim() != "yes" {
        tracing::warn!("Login not confirmed, no session stored");
        return Ok(false);
    }

    let session_key = client
        .get_session(&token)
        .await
        .context("requesting Last.fm session")?;
    persist_session_key(path, &session_key)?;
    tracing::info!("Stored Last.fm session in {}", path.display());
    Ok(true)
}
