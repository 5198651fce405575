//! TLS termination. The engine is a sans-IO rustls server session stepped
//! by whichever worker thread currently owns the connection; the poller
//! never performs TLS work.

use crate::config::{ClientAuth, SslConfig};
use crate::net::support::{SocketError, SocketResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

#[derive(Debug)]
pub enum TlsError {
    Io(io::ErrorKind),
    Pem(String),
    Config(String),
    NoPrivateKey,
    NoCaFile,
    EncryptedKeyUnsupported,
    UnknownProtocol(String),
}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> Self {
        TlsError::Io(err.kind())
    }
}

/// Result of driving the handshake as far as the socket allows.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeStatus {
    Complete,
    NeedRead,
    NeedWrite,
    Failed,
}

/// Process-wide TLS configuration, built once at endpoint init.
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    pub fn from_config(ssl: &SslConfig) -> Result<TlsContext, TlsError> {
        if ssl.key_password.is_some() {
            return Err(TlsError::EncryptedKeyUnsupported);
        }

        let certs = load_certs(ssl)?;
        let key = load_key(ssl)?;
        let versions = protocol_versions(&ssl.protocols)?;

        let builder = ServerConfig::builder_with_protocol_versions(&versions);

        let builder = match ssl.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Required => {
                let ca_file = ssl.ca_file.as_ref().ok_or(TlsError::NoCaFile)?;
                let mut roots = RootCertStore::empty();

                let mut reader = BufReader::new(File::open(ca_file)?);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|err| TlsError::Pem(err.to_string()))?;
                    roots
                        .add(cert)
                        .map_err(|err| TlsError::Config(err.to_string()))?;
                }

                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|err| TlsError::Config(err.to_string()))?;

                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|err| TlsError::Config(err.to_string()))?;

        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    /// Builds a context from in-memory PEM data. Used by tests and by
    /// embedders that do not keep key material on disk.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsContext, TlsError> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| TlsError::Pem(err.to_string()))?;

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|err| TlsError::Pem(err.to_string()))?
            .ok_or(TlsError::NoPrivateKey)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| TlsError::Config(err.to_string()))?;

        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    pub fn new_engine(&self) -> Result<TlsEngine, TlsError> {
        let session = ServerConnection::new(Arc::clone(&self.config))
            .map_err(|err| TlsError::Config(err.to_string()))?;

        Ok(TlsEngine { session })
    }
}

fn load_certs(ssl: &SslConfig) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(&ssl.cert_file)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Pem(err.to_string()))
}

fn load_key(ssl: &SslConfig) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(&ssl.key_file)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| TlsError::Pem(err.to_string()))?
        .ok_or(TlsError::NoPrivateKey)
}

fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }

    let mut versions = Vec::new();
    for name in names {
        match name.as_str() {
            "TLSv1.2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" => versions.push(&rustls::version::TLS13),
            other => return Err(TlsError::UnknownProtocol(other.to_string())),
        }
    }

    Ok(versions)
}

/// Per-connection TLS session.
pub struct TlsEngine {
    session: ServerConnection,
}

impl TlsEngine {
    #[inline]
    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Drives the handshake as far as the non-blocking socket allows.
    pub fn handshake<S: Read + Write>(&mut self, sock: &mut S) -> HandshakeStatus {
        loop {
            if self.session.wants_write() {
                match self.session.write_tls(sock) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::NeedWrite;
                    }
                    Err(_) => return HandshakeStatus::Failed,
                }
                continue;
            }

            if !self.session.is_handshaking() {
                return HandshakeStatus::Complete;
            }

            if self.session.wants_read() {
                match self.session.read_tls(sock) {
                    Ok(0) => return HandshakeStatus::Failed,
                    Ok(_) => {
                        if self.session.process_new_packets().is_err() {
                            // Flush the alert rustls queued, best effort.
                            let _ = self.session.write_tls(sock);
                            return HandshakeStatus::Failed;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::NeedRead;
                    }
                    Err(_) => return HandshakeStatus::Failed,
                }
            }
        }
    }

    /// Reads plaintext into `dst`. `Wait` means no ciphertext is currently
    /// available on the socket.
    pub fn read<S: Read + Write>(&mut self, sock: &mut S, dst: &mut [u8]) -> SocketResult<usize> {
        loop {
            // Serve plaintext already decrypted before touching the socket.
            // A clean zero from the reader is close_notify.
            match self.session.reader().read(dst) {
                Ok(0) => return Err(SocketError::Eof),
                Ok(count) => return Ok(count),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }

            match self.session.read_tls(sock) {
                Ok(0) => return Err(SocketError::Eof),
                Ok(_) => {
                    let state = self
                        .session
                        .process_new_packets()
                        .map_err(|_| SocketError::Io(io::ErrorKind::InvalidData))?;

                    if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
                        return Err(SocketError::Eof);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(SocketError::Wait)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Buffers `src` as plaintext and pushes as much ciphertext as the
    /// socket accepts. Returns the plaintext bytes consumed.
    pub fn write<S: Read + Write>(&mut self, sock: &mut S, src: &[u8]) -> SocketResult<usize> {
        let count = self
            .session
            .writer()
            .write(src)
            .map_err(SocketError::from)?;

        self.flush(sock)?;
        Ok(count)
    }

    /// Pushes pending ciphertext. Returns true once nothing is pending.
    pub fn flush<S: Read + Write>(&mut self, sock: &mut S) -> SocketResult<bool> {
        while self.session.wants_write() {
            match self.session.write_tls(sock) {
                Ok(0) => return Err(SocketError::Io(io::ErrorKind::WriteZero)),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(true)
    }

    /// Queues the close-notify alert; the next flush pushes it out.
    pub fn start_close(&mut self) {
        self.session.send_close_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection};
    use std::collections::VecDeque;

    /// In-memory duplex transport: reads drain the inbound queue, writes
    /// fill the outbound queue.
    struct Pipe {
        inbound: VecDeque<u8>,
        outbound: VecDeque<u8>,
    }

    impl Pipe {
        fn new() -> Pipe {
            Pipe {
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
            }
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(count) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(count)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_context() -> (TlsContext, ClientConnection) {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = signed.cert.pem();
        let key_pem = signed.key_pair.serialize_pem();

        let context = TlsContext::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(signed.cert.der().clone()).unwrap();

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let client = ClientConnection::new(
            Arc::new(client_config),
            ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();

        (context, client)
    }

    /// Shuttles ciphertext between the client session and the server
    /// engine until both are out of handshake.
    fn pump(client: &mut ClientConnection, engine: &mut TlsEngine, server_pipe: &mut Pipe) {
        for _ in 0..32 {
            // Client flushes into the server's inbound queue.
            while client.wants_write() {
                let mut wire = Vec::new();
                client.write_tls(&mut wire).unwrap();
                server_pipe.inbound.extend(wire);
            }

            let status = engine.handshake(server_pipe);
            assert_ne!(status, HandshakeStatus::Failed);

            // Server output back into the client.
            if !server_pipe.outbound.is_empty() {
                let wire: Vec<u8> = server_pipe.outbound.drain(..).collect();
                let mut cursor = &wire[..];
                while !cursor.is_empty() {
                    client.read_tls(&mut cursor).unwrap();
                }
                client.process_new_packets().unwrap();
            }

            if status == HandshakeStatus::Complete && !client.is_handshaking() {
                return;
            }
        }

        panic!("Handshake did not converge");
    }

    #[test]
    fn test_handshake_and_plaintext_roundtrip() {
        let (context, mut client) = test_context();
        let mut engine = context.new_engine().unwrap();
        let mut pipe = Pipe::new();

        pump(&mut client, &mut engine, &mut pipe);

        // Client sends one application record.
        client.writer().write_all(b"hello").unwrap();
        let mut wire = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut wire).unwrap();
        }
        pipe.inbound.extend(wire);

        let mut plain = [0u8; 16];
        let count = engine.read(&mut pipe, &mut plain).unwrap();
        assert_eq!(&plain[..count], b"hello");

        // And the server answers.
        engine.write(&mut pipe, b"world").unwrap();
        let wire: Vec<u8> = pipe.outbound.drain(..).collect();
        let mut cursor = &wire[..];
        while !cursor.is_empty() {
            client.read_tls(&mut cursor).unwrap();
        }
        client.process_new_packets().unwrap();

        let mut echoed = Vec::new();
        client.reader().read_to_end(&mut echoed).ok();
        assert_eq!(&echoed, b"world");
    }

    #[test]
    fn test_engine_reports_need_read_on_empty_socket() {
        let (context, _client) = test_context();
        let mut engine = context.new_engine().unwrap();
        let mut pipe = Pipe::new();

        assert_eq!(engine.handshake(&mut pipe), HandshakeStatus::NeedRead);
    }

    #[test]
    fn test_encrypted_key_rejected() {
        let ssl = SslConfig {
            cert_file: "/nonexistent.pem".into(),
            key_file: "/nonexistent.key".into(),
            key_password: Some("secret".to_string()),
            protocols: Vec::new(),
            client_auth: ClientAuth::None,
            ca_file: None,
        };

        assert!(matches!(
            TlsContext::from_config(&ssl),
            Err(TlsError::EncryptedKeyUnsupported)
        ));
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result = protocol_versions(&["SSLv3".to_string()]);
        assert!(matches!(result, Err(TlsError::UnknownProtocol(_))));
    }
}
