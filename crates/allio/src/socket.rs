//! Datagram, listening and stream sockets.
//!
//! Sockets are non-blocking descriptors on Linux and overlapped Winsock
//! sockets on Windows; blocking calls run through the thread's blocking
//! multiplexer either way.

use std::net::SocketAddr;

use allio_core::{
    Arguments, Completion, Deadline, Error, HandleFlags, ObjectKind, OperationRef, Result,
};
use allio_module::sys::{self, SocketKind};

use crate::context::Context;
use crate::handle::OwnedHandle;
use crate::{block_operation, received, transferred};

const DEFAULT_BACKLOG: i32 = 128;

fn open(address: &SocketAddr, kind: SocketKind) -> Result<OwnedHandle> {
    Ok(OwnedHandle::new(sys::socket(address, kind)?, HandleFlags::SOCKET))
}

/// Bound socket, closed again if binding fails.
fn open_bound(address: &SocketAddr, kind: SocketKind, reuse: bool) -> Result<OwnedHandle> {
    let handle = open(address, kind)?;
    if reuse {
        sys::set_reuse_address(handle.raw())?;
    }
    sys::bind(handle.raw(), address)?;
    Ok(handle)
}

// ── Datagram ──

#[derive(Debug)]
pub struct DatagramSocket {
    handle: OwnedHandle,
}

impl DatagramSocket {
    pub fn bind(address: SocketAddr) -> Result<Self> {
        Ok(Self {
            handle: open_bound(&address, SocketKind::Datagram, false)?,
        })
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        sys::local_address(self.handle.raw())
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    pub fn send_to(&self, buffer: Vec<u8>, address: SocketAddr, deadline: Deadline) -> Result<usize> {
        let args = Arguments::SendTo { buffer, address };
        transferred(block_operation(self.handle.request(ObjectKind::DatagramSocket, args, deadline, None))?)
    }

    /// One datagram and its sender. The buffer is truncated to the
    /// datagram's length.
    pub fn receive_from(&self, buffer: Vec<u8>, deadline: Deadline) -> Result<(Vec<u8>, SocketAddr)> {
        let args = Arguments::ReceiveFrom { buffer };
        datagram(block_operation(self.handle.request(ObjectKind::DatagramSocket, args, deadline, None))?)
    }

    pub async fn send_to_async(
        &self,
        context: &Context,
        buffer: Vec<u8>,
        address: SocketAddr,
        deadline: Deadline,
    ) -> Result<usize> {
        let args = Arguments::SendTo { buffer, address };
        let request = self.handle.request(ObjectKind::DatagramSocket, args, deadline, Some(context));
        transferred(context.submit(request).await?)
    }

    pub async fn receive_from_async(
        &self,
        context: &Context,
        buffer: Vec<u8>,
        deadline: Deadline,
    ) -> Result<(Vec<u8>, SocketAddr)> {
        let args = Arguments::ReceiveFrom { buffer };
        let request = self.handle.request(ObjectKind::DatagramSocket, args, deadline, Some(context));
        datagram(context.submit(request).await?)
    }
}

fn datagram(operation: OperationRef) -> Result<(Vec<u8>, SocketAddr)> {
    let address = match operation.outcome()? {
        Completion::Received { address, .. } => address,
        _ => return Err(Error::UnknownFailure),
    };
    Ok((received(operation)?, address))
}

// ── Listen ──

#[derive(Debug)]
pub struct ListenSocket {
    handle: OwnedHandle,
}

impl ListenSocket {
    /// Bind with address reuse and start listening.
    pub fn bind(address: SocketAddr) -> Result<Self> {
        Self::bind_with_backlog(address, DEFAULT_BACKLOG)
    }

    pub fn bind_with_backlog(address: SocketAddr, backlog: i32) -> Result<Self> {
        let handle = open_bound(&address, SocketKind::Stream, true)?;
        sys::listen(handle.raw(), backlog)?;
        Ok(Self { handle })
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        sys::local_address(self.handle.raw())
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    pub fn accept(&self, deadline: Deadline) -> Result<(StreamSocket, SocketAddr)> {
        accepted(block_operation(self.handle.request(ObjectKind::ListenSocket, Arguments::Accept, deadline, None))?)
    }

    pub async fn accept_async(&self, context: &Context, deadline: Deadline) -> Result<(StreamSocket, SocketAddr)> {
        let request = self.handle.request(ObjectKind::ListenSocket, Arguments::Accept, deadline, Some(context));
        accepted(context.submit(request).await?)
    }
}

fn accepted(operation: OperationRef) -> Result<(StreamSocket, SocketAddr)> {
    match operation.outcome()? {
        Completion::Accepted { handle, address } => Ok((
            StreamSocket {
                handle: OwnedHandle::new(handle, HandleFlags::SOCKET),
            },
            address,
        )),
        _ => Err(Error::UnknownFailure),
    }
}

// ── Stream ──

#[derive(Debug)]
pub struct StreamSocket {
    handle: OwnedHandle,
}

impl StreamSocket {
    /// Unconnected socket of `address`'s family.
    pub fn new(address: &SocketAddr) -> Result<Self> {
        Ok(Self {
            handle: open(address, SocketKind::Stream)?,
        })
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        sys::local_address(self.handle.raw())
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    pub fn connect(&self, address: SocketAddr, deadline: Deadline) -> Result<()> {
        let args = Arguments::Connect { address };
        block_operation(self.handle.request(ObjectKind::StreamSocket, args, deadline, None))?
            .outcome()
            .map(|_| ())
    }

    /// Empty once the peer has shut down its side.
    pub fn read(&self, buffer: Vec<u8>, deadline: Deadline) -> Result<Vec<u8>> {
        let args = Arguments::Read { buffer };
        received(block_operation(self.handle.request(ObjectKind::StreamSocket, args, deadline, None))?)
    }

    pub fn write(&self, buffer: Vec<u8>, deadline: Deadline) -> Result<usize> {
        let args = Arguments::Write { buffer };
        transferred(block_operation(self.handle.request(ObjectKind::StreamSocket, args, deadline, None))?)
    }

    pub async fn connect_async(&self, context: &Context, address: SocketAddr, deadline: Deadline) -> Result<()> {
        let args = Arguments::Connect { address };
        let request = self.handle.request(ObjectKind::StreamSocket, args, deadline, Some(context));
        context.submit(request).await?.outcome().map(|_| ())
    }

    pub async fn read_async(&self, context: &Context, buffer: Vec<u8>, deadline: Deadline) -> Result<Vec<u8>> {
        let args = Arguments::Read { buffer };
        let request = self.handle.request(ObjectKind::StreamSocket, args, deadline, Some(context));
        received(context.submit(request).await?)
    }

    pub async fn write_async(&self, context: &Context, buffer: Vec<u8>, deadline: Deadline) -> Result<usize> {
        let args = Arguments::Write { buffer };
        let request = self.handle.request(ObjectKind::StreamSocket, args, deadline, Some(context));
        transferred(context.submit(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::MultiplexerConfig;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_receive_with_instant_deadline_times_out() {
        let socket = DatagramSocket::bind(loopback()).unwrap();
        let blocking = socket.receive_from(vec![0; 16], Deadline::instant());
        assert_eq!(blocking, Err(Error::AsyncOperationTimedOut));

        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let waited = context
            .block_on(socket.receive_from_async(&context, vec![0; 16], Deadline::instant()))
            .unwrap();
        assert_eq!(waited, Err(Error::AsyncOperationTimedOut));
    }

    #[test]
    fn test_datagram_exchange() {
        let a = DatagramSocket::bind(loopback()).unwrap();
        let b = DatagramSocket::bind(loopback()).unwrap();
        let to = b.local_address().unwrap();
        assert_eq!(a.send_to(b"dgram".to_vec(), to, Deadline::never()), Ok(5));
        let (data, from) = b.receive_from(vec![0; 64], Deadline::never()).unwrap();
        assert_eq!(data, b"dgram");
        assert_eq!(from, a.local_address().unwrap());
    }

    #[test]
    fn test_accept_and_connect_exchange_bytes() {
        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let listener = ListenSocket::bind(loopback()).unwrap();
        let address = listener.local_address().unwrap();

        let client = thread::spawn(move || -> Result<Vec<u8>> {
            let stream = StreamSocket::new(&address)?;
            stream.connect(address, Deadline::relative(Duration::from_secs(5)))?;
            stream.write(vec![42], Deadline::never())?;
            stream.read(vec![0; 1], Deadline::never())
        });

        let served = context
            .block_on(async {
                let (stream, _) = listener.accept_async(&context, Deadline::never()).await?;
                let request = stream.read_async(&context, vec![0; 1], Deadline::never()).await?;
                let reply = (request[0] as i8).wrapping_neg() as u8;
                stream.write_async(&context, vec![reply], Deadline::never()).await?;
                Ok::<_, Error>(request)
            })
            .unwrap()
            .unwrap();

        assert_eq!(served, vec![42]);
        assert_eq!(client.join().unwrap().unwrap(), vec![(-42i8) as u8]);
    }

    #[test]
    fn test_connect_async_to_blocking_accept() {
        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let listener = ListenSocket::bind(loopback()).unwrap();
        let address = listener.local_address().unwrap();

        let server = thread::spawn(move || -> Result<Vec<u8>> {
            let (stream, _) = listener.accept(Deadline::relative(Duration::from_secs(5)))?;
            stream.read(vec![0; 8], Deadline::never())
        });

        let stream = StreamSocket::new(&address).unwrap();
        let sent = context
            .block_on(async {
                stream.connect_async(&context, address, Deadline::never()).await?;
                stream.write_async(&context, b"hello".to_vec(), Deadline::never()).await
            })
            .unwrap();
        assert_eq!(sent, Ok(5));
        assert_eq!(server.join().unwrap().unwrap(), b"hello");
    }
}
