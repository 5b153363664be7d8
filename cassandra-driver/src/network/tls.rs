//! TLS layer of driver connections, backed by OpenSSL.

use std::io;
use std::pin::Pin;

use openssl::ssl::{Ssl, SslContext};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// A wrapper around a TLS error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error(transparent)]
    OpenSsl010(#[from] openssl::error::ErrorStack),
}

impl From<TlsError> for io::Error {
    fn from(value: TlsError) -> Self {
        match value {
            TlsError::OpenSsl010(e) => e.into(),
        }
    }
}

/// Runs the client side of the TLS handshake over an established TCP stream.
pub(crate) async fn connect(
    context: &SslContext,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>, io::Error> {
    let ssl = Ssl::new(context).map_err(TlsError::from)?;
    let mut stream = SslStream::new(ssl, stream).map_err(TlsError::from)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(io::Error::other)?;
    Ok(stream)
}
