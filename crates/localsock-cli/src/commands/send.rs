use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect, send `message`, half-close and print whatever comes back
pub async fn run(path: &str, message: &str) -> Result<()> {
    let mut stream = connect(path)
        .await
        .with_context(|| format!("Failed to connect to {}", path.replace('\0', "@")))?;

    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;

    let mut reply = String::new();
    tokio::time::timeout(REPLY_TIMEOUT, stream.read_to_string(&mut reply))
        .await
        .context("Timed out waiting for reply")??;

    println!("{}", reply);
    Ok(())
}

async fn connect(path: &str) -> std::io::Result<UnixStream> {
    match path.strip_prefix('\0') {
        Some(name) => connect_abstract(name),
        None => UnixStream::connect(path).await,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> std::io::Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract namespace sockets are not supported on this platform",
    ))
}
