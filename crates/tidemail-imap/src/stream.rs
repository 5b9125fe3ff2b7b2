//! Byte transports under an IMAP session.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{ImapConfig, Security};
use crate::{Error, Result};

/// Tag used for the one command sent before TLS is up.
const STARTTLS_TAG: &str = "tm0";

/// Anything an IMAP client can talk through.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

/// An open connection, plaintext or TLS.
pub type ImapStream = Box<dyn Transport>;

/// Opens a transport to the configured server.
///
/// For [`Security::StartTls`] the plaintext greeting and the `STARTTLS`
/// exchange happen here, so the returned stream is already encrypted.
///
/// # Errors
///
/// Returns an error if the TCP connection, the STARTTLS exchange or the
/// TLS handshake fails.
pub async fn open(config: &ImapConfig) -> Result<ImapStream> {
    let address = (config.host.as_str(), config.port);
    match config.security {
        Security::Tls => {
            let server_name = ServerName::try_from(config.host.clone())?;
            let tcp = TcpStream::connect(address).await?;
            let tls = tls_connector().connect(server_name, tcp).await?;
            Ok(Box::new(tls))
        }
        Security::StartTls => {
            let server_name = ServerName::try_from(config.host.clone())?;
            let tcp = TcpStream::connect(address).await?;
            let tcp = negotiate_starttls(tcp).await?;
            let tls = tls_connector().connect(server_name, tcp).await?;
            Ok(Box::new(tls))
        }
        Security::None => Ok(Box::new(TcpStream::connect(address).await?)),
    }
}

/// Reads the plaintext greeting, sends `STARTTLS` and waits for the tagged
/// `OK`, handing back the same stream ready for the TLS handshake.
///
/// # Errors
///
/// Returns [`Error::StartTls`] if the greeting is not `* OK`, the server
/// answers anything but `OK`, or bytes arrive after the tagged reply.
pub async fn negotiate_starttls<S>(stream: S) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    let greeting = read_line(&mut reader).await?;
    if !has_status(greeting.strip_prefix("* "), "OK") {
        return Err(Error::StartTls(format!("unexpected greeting: {greeting}")));
    }

    let command = format!("{STARTTLS_TAG} STARTTLS\r\n");
    reader.get_mut().write_all(command.as_bytes()).await?;
    reader.get_mut().flush().await?;

    loop {
        let line = read_line(&mut reader).await?;
        let tagged = line
            .strip_prefix(STARTTLS_TAG)
            .and_then(|rest| rest.strip_prefix(' '));
        if let Some(status) = tagged {
            if has_status(Some(status), "OK") {
                break;
            }
            return Err(Error::StartTls(status.to_string()));
        }
        if has_status(line.strip_prefix("* "), "BYE") {
            return Err(Error::StartTls(line));
        }
    }

    // Anything already buffered was sent in the clear and must not be
    // treated as part of the encrypted session.
    if !reader.buffer().is_empty() {
        return Err(Error::StartTls(
            "plaintext data after the STARTTLS reply".to_string(),
        ));
    }

    debug!("STARTTLS accepted");
    Ok(reader.into_inner())
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Disconnected(
            "server closed the connection before TLS".to_string(),
        ));
    }
    Ok(line.trim_end().to_string())
}

fn has_status(rest: Option<&str>, status: &str) -> bool {
    rest.and_then(|r| r.split_ascii_whitespace().next())
        .is_some_and(|word| word.eq_ignore_ascii_case(status))
}

/// TLS connector trusting the webpki roots.
fn tls_connector() -> TlsConnector {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn boxed_transport_passes_bytes_through() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"a1 NOOP\r\n")
            .build();
        let mut stream: ImapStream = Box::new(mock);

        let mut greeting = [0u8; 12];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"* OK ready\r\n");
        stream.write_all(b"a1 NOOP\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn starttls_hands_back_the_socket_after_ok() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] ready\r\n")
            .write(b"tm0 STARTTLS\r\n")
            .read(b"* CAPABILITY IMAP4rev1 STARTTLS\r\n")
            .read(b"tm0 OK Begin TLS negotiation now\r\n")
            .write(b"\x16\x03\x01")
            .build();

        let mut stream = tokio_test::assert_ok!(negotiate_starttls(mock).await);

        // The handshake goes out on the same socket.
        stream.write_all(b"\x16\x03\x01").await.unwrap();
    }

    #[tokio::test]
    async fn refused_starttls_is_an_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"tm0 STARTTLS\r\n")
            .read(b"tm0 NO [ALERT] TLS unavailable\r\n")
            .build();

        let err = negotiate_starttls(mock).await.unwrap_err();
        assert!(matches!(err, Error::StartTls(msg) if msg.starts_with("NO")));
    }

    #[tokio::test]
    async fn bytes_after_the_ok_are_rejected() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"tm0 STARTTLS\r\n")
            .read(b"tm0 OK go\r\n* OK injected\r\n")
            .build();

        let err = negotiate_starttls(mock).await.unwrap_err();
        assert!(matches!(err, Error::StartTls(_)));
    }

    #[tokio::test]
    async fn preauth_greeting_cannot_upgrade() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* PREAUTH logged in\r\n")
            .build();

        let err = negotiate_starttls(mock).await.unwrap_err();
        assert!(matches!(err, Error::StartTls(_)));
    }
}
