//! The blocking transport contract of an association.
//!
//! An association runtime needs three things from its transport:
//! a read half owned by the dedicated reader worker,
//! a write half guarded by the writer lock,
//! and an out-of-band way to shut the connection down
//! so that a blocked read on the worker returns.
//! [`IntoTransport`] captures that split;
//! the provided implementation covers plain [`TcpStream`],
//! and a TLS stream fits the same seam
//! without the association knowing the difference.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A transport connection split into its association-facing parts.
pub struct Transport {
    /// the read half, moved into the reader worker
    pub reader: Box<dyn Read + Send>,
    /// the write half, guarded by the association's writer lock
    pub writer: Box<dyn Write + Send>,
    /// closes the connection from any thread,
    /// unblocking a reader worker parked on a pending read
    pub shutdown: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Conversion of a connected byte stream into a [`Transport`].
pub trait IntoTransport {
    /// Split this connection into read/write halves
    /// and a shutdown handle.
    fn into_transport(self) -> io::Result<Transport>;
}

impl IntoTransport for TcpStream {
    fn into_transport(self) -> io::Result<Transport> {
        let reader = self.try_clone()?;
        let closer = self.try_clone()?;
        Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(self),
            shutdown: Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::IntoTransport;

    #[test]
    fn shutdown_unblocks_a_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"ping").unwrap();
            // hold the connection open until the other end closes it
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        let transport = TcpStream::connect(addr)
            .unwrap()
            .into_transport()
            .unwrap();
        let mut reader = transport.reader;

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let blocked = thread::spawn(move || {
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).map(|_| rest)
        });
        (transport.shutdown)();

        // the read returns instead of hanging forever
        let out = blocked.join().unwrap();
        assert!(matches!(out.as_deref(), Ok([]) | Err(_)));
        drop(transport.writer);
        peer.join().unwrap();
    }
}
