//! Connection lifecycle: transport connect, the SASL EXTERNAL handshake,
//! the reader task, reply correlation, and signal fan-out.

pub mod socket;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::Address;
use crate::message_protocol::body::Body;
use crate::message_protocol::{frame_length, Message, MessageType, MethodCall, MIN_MESSAGE_SIZE};
use crate::type_system::types::*;
use crate::type_system::Endianness;
use crate::{Error, ProtocolError};

use self::socket::Socket;

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Capacity of each subscription's signal queue. A consumer that falls this
/// far behind starts losing the oldest signals.
pub(crate) const SIGNAL_QUEUE_CAPACITY: usize = 64;

/// The match predicate of a signal subscription. Empty fields match
/// anything.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl SignalFilter {
    fn matches(&self, message: &Message) -> bool {
        fn field_matches(filter: &Option<String>, value: Option<&str>) -> bool {
            match filter {
                None => true,
                Some(want) => value == Some(want.as_str()),
            }
        }

        field_matches(&self.sender, message.sender())
            && field_matches(&self.path, message.path())
            && field_matches(&self.interface, message.interface())
            && field_matches(&self.member, message.member())
    }
}

/// One received signal, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Type>,
}

impl SignalMessage {
    fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            sender: message.sender().map(str::to_string),
            path: message.path()?.to_string(),
            interface: message.interface()?.to_string(),
            member: message.member()?.to_string(),
            body: message.body.arguments.clone(),
        })
    }
}

struct Subscription {
    id: u64,
    filter: SignalFilter,
    sender: smol::channel::Sender<SignalMessage>,
    /// A second handle on the queue so the reader can evict the oldest entry
    /// when the queue is full.
    stealer: smol::channel::Receiver<SignalMessage>,
    overflowed: Arc<AtomicBool>,
}

pub(crate) struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) receiver: smol::channel::Receiver<SignalMessage>,
    pub(crate) overflowed: Arc<AtomicBool>,
}

struct State {
    closed: bool,
    unique_name: Option<String>,
    pending: HashMap<u32, smol::channel::Sender<crate::Result<Message>>>,
    subscriptions: Vec<Subscription>,
    next_subscription_id: u64,
}

struct Inner {
    socket: Socket,
    cap_unix_fd: bool,
    serial: AtomicU32,
    state: Mutex<State>,
    /// Serialises frame writes so concurrent senders cannot interleave.
    write_lock: smol::lock::Mutex<()>,
    reader_task: Mutex<Option<smol::Task<()>>>,
}

impl Inner {
    /// Monotonic per connection, wrapping and skipping zero.
    fn next_serial(&self) -> NonZeroU32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(serial) = NonZeroU32::new(serial) {
                return serial;
            }
        }
    }
}

/// Ignore mutex poisoning: the protected state stays consistent because
/// every critical section is short and panic-free.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// An open bus connection. Cheap to clone; all clones share the socket, the
/// pending-call table, and the subscription list.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to the session bus.
    pub async fn session() -> crate::Result<Self> {
        Self::open(&Address::session()?).await
    }

    /// Connect to the system bus.
    pub async fn system() -> crate::Result<Self> {
        Self::open(&Address::system()?).await
    }

    /// Connect to the first reachable transport of `address`, authenticate,
    /// and say `Hello`.
    pub async fn open(address: &Address) -> crate::Result<Self> {
        let mut last_error = None;
        for transport in address.transports() {
            match Socket::connect(transport).await {
                Ok(socket) => return Self::with_socket(socket).await,
                Err(err) => {
                    log::debug!("Could not connect {:?}: {}", transport, err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Address("address has no transports".into())))
    }

    pub(crate) async fn with_socket(socket: Socket) -> crate::Result<Self> {
        // The protocol requires that the first thing we send is a null byte.
        socket.send_all(&[0], &[]).await?;

        let mut handshake = Handshake::new(&socket);
        handshake.auth().await?;
        let cap_unix_fd = handshake.negotiate_unix_fd().await?;
        handshake.begin().await?;
        let leftover = handshake.finish();

        let inner = Arc::new(Inner {
            socket,
            cap_unix_fd,
            serial: AtomicU32::new(0),
            state: Mutex::new(State {
                closed: false,
                unique_name: None,
                pending: HashMap::new(),
                subscriptions: Vec::new(),
                next_subscription_id: 0,
            }),
            write_lock: smol::lock::Mutex::new(()),
            reader_task: Mutex::new(None),
        });

        let task = smol::spawn(read_loop(inner.clone(), leftover));
        *lock(&inner.reader_task) = Some(task);

        let connection = Self { inner };

        // The first message on a new connection must be Hello; the reply
        // carries the unique name the bus assigned us. A failure here must
        // tear the connection down, or the reader task would keep it alive.
        match connection.say_hello().await {
            Ok(unique_name) => {
                log::info!("Connected to the bus as {}.", unique_name);
                lock(&connection.inner.state).unique_name = Some(unique_name);
                Ok(connection)
            }
            Err(err) => {
                connection.close_now();
                Err(err)
            }
        }
    }

    async fn say_hello(&self) -> crate::Result<String> {
        let reply = self
            .call(MethodCall::new(
                DBUS_SERVICE,
                DBUS_PATH,
                Some(DBusString::new(DBUS_INTERFACE)),
                "Hello",
                Body::default(),
            ))
            .await?;
        let unique_name = reply
            .body
            .arguments
            .get(0)
            .and_then(Type::as_str)
            .ok_or_else(|| ProtocolError::Invalid("Hello reply carried no name".into()))?
            .to_string();
        Ok(unique_name)
    }

    /// The unique name the bus assigned to this connection.
    pub fn unique_name(&self) -> Option<String> {
        lock(&self.inner.state).unique_name.clone()
    }

    /// Whether both sides agreed to pass file descriptors.
    pub fn can_pass_unix_fd(&self) -> bool {
        self.inner.cap_unix_fd
    }

    /// Send a method call and await its reply.
    ///
    /// Dropping the returned future detaches the waiter: the pending entry
    /// is removed and a late reply is discarded. No wire-level cancel
    /// exists.
    pub async fn call(&self, method_call: MethodCall) -> crate::Result<Message> {
        let serial = self.inner.next_serial();
        let message = Message::method_call(method_call, serial);
        self.call_message(message).await
    }

    async fn call_message(&self, message: Message) -> crate::Result<Message> {
        let serial = message.serial.get();
        let (bytes, fds) = message.marshal(Endianness::native())?;
        if !fds.is_empty() && !self.inner.cap_unix_fd {
            return Err(
                ProtocolError::Invalid("peer did not agree to fd passing".into()).into(),
            );
        }

        let (sender, receiver) = smol::channel::bounded(1);
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(Error::Disconnected);
            }
            // Installed before the write so even an instant reply finds it.
            state.pending.insert(serial, sender);
        }
        let guard = PendingGuard {
            inner: self.inner.clone(),
            serial,
        };

        {
            let _write = self.inner.write_lock.lock().await;
            self.inner.socket.send_all(&bytes, &fds).await?;
        }
        log::trace!("Sent method call with serial {}.", serial);

        let result = match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        };
        drop(guard);
        result
    }

    /// Send a method call with NO_REPLY_EXPECTED; nothing is awaited beyond
    /// the write itself.
    pub async fn call_no_reply(&self, method_call: MethodCall) -> crate::Result<()> {
        let serial = self.inner.next_serial();
        let mut message = Message::method_call(method_call, serial);
        message.flag_no_reply_expected = true;

        let (bytes, fds) = message.marshal(Endianness::native())?;
        if !fds.is_empty() && !self.inner.cap_unix_fd {
            return Err(
                ProtocolError::Invalid("peer did not agree to fd passing".into()).into(),
            );
        }
        if lock(&self.inner.state).closed {
            return Err(Error::Disconnected);
        }

        let _write = self.inner.write_lock.lock().await;
        self.inner.socket.send_all(&bytes, &fds).await
    }

    /// Install a local subscription. Bus-side match rules are the client
    /// layer's business.
    pub(crate) fn subscribe(&self, filter: SignalFilter) -> crate::Result<SubscriptionHandle> {
        let (sender, receiver) = smol::channel::bounded(SIGNAL_QUEUE_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(Error::Disconnected);
        }
        let id = state.next_subscription_id;
        state.next_subscription_id += 1;
        state.subscriptions.push(Subscription {
            id,
            filter,
            sender,
            stealer: receiver.clone(),
            overflowed: overflowed.clone(),
        });

        Ok(SubscriptionHandle {
            id,
            receiver,
            overflowed,
        })
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        let mut state = lock(&self.inner.state);
        state.subscriptions.retain(|subscription| subscription.id != id);
    }

    /// Tear the connection down: the reader task stops, outstanding calls
    /// fail with [Error::Disconnected], and signal queues close.
    pub async fn close(&self) {
        let task = lock(&self.inner.reader_task).take();
        if let Some(task) = task {
            task.cancel().await;
        }
        teardown(&self.inner);
    }

    /// Synchronous best-effort teardown for drop paths.
    pub(crate) fn close_now(&self) {
        // Dropping the task handle cancels the reader.
        drop(lock(&self.inner.reader_task).take());
        teardown(&self.inner);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }
}

/// Removes the pending entry for a call whose waiter went away before the
/// reply did.
struct PendingGuard {
    inner: Arc<Inner>,
    serial: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        if state.pending.remove(&self.serial).is_some() {
            log::trace!("Detached pending call {}.", self.serial);
        }
    }
}

fn teardown(inner: &Inner) {
    let mut state = lock(&inner.state);
    if state.closed {
        return;
    }
    state.closed = true;

    for (serial, sender) in state.pending.drain() {
        log::trace!("Failing pending call {}: connection closed.", serial);
        let _ = sender.try_send(Err(Error::Disconnected));
    }
    for subscription in state.subscriptions.drain(..) {
        subscription.sender.close();
    }
}

/// The single reader: frames the byte stream, parses each message, and
/// dispatches it. Any error is terminal for the connection.
async fn read_loop(inner: Arc<Inner>, leftover: Vec<u8>) {
    let mut reader = FrameReader {
        buf: leftover,
        fds: Vec::new(),
    };

    loop {
        let message = match reader.next_frame(&inner.socket).await {
            Ok(message) => message,
            Err(Error::Disconnected) => {
                log::debug!("Peer closed the connection.");
                break;
            }
            Err(err) => {
                log::warn!("Connection reader failed: {}", err);
                break;
            }
        };

        if let Some(reply) = dispatch(&inner, message) {
            let outcome = async {
                let (bytes, fds) = reply.marshal(Endianness::native())?;
                let _write = inner.write_lock.lock().await;
                inner.socket.send_all(&bytes, &fds).await
            }
            .await;
            if let Err(err) = outcome {
                log::warn!("Could not answer stray method call: {}", err);
                break;
            }
        }
    }

    teardown(&inner);
    // The task is finishing on its own; detach the handle rather than have
    // it cancel us.
    if let Some(task) = lock(&inner.reader_task).take() {
        task.detach();
    }
}

struct FrameReader {
    buf: Vec<u8>,
    fds: Vec<RawFd>,
}

impl FrameReader {
    async fn fill(&mut self, socket: &Socket) -> crate::Result<()> {
        let mut chunk = [0u8; 4096];
        let (read, fds) = socket.recvmsg(&mut chunk).await?;
        if read == 0 {
            return Err(Error::Disconnected);
        }
        self.buf.extend_from_slice(&chunk[..read]);
        self.fds.extend(fds);
        Ok(())
    }

    async fn next_frame(&mut self, socket: &Socket) -> crate::Result<Message> {
        while self.buf.len() < MIN_MESSAGE_SIZE {
            self.fill(socket).await?;
        }
        let total = frame_length(&self.buf[..MIN_MESSAGE_SIZE])?;
        while self.buf.len() < total {
            self.fill(socket).await?;
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let message = Message::unmarshal(&frame, &self.fds)?;

        // The frame consumed the first UNIX_FDS descriptors of the table;
        // anything beyond them arrived for a later frame in the same read.
        let used = message.unix_fds().unwrap_or(0) as usize;
        self.fds.drain(..used);

        log::trace!(
            "Received {:?} with serial {}.",
            message.message_type,
            message.serial
        );
        Ok(message)
    }
}

/// Route one inbound message. Returns a reply to send for stray method
/// calls.
fn dispatch(inner: &Inner, message: Message) -> Option<Message> {
    match message.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            let reply_serial = message.reply_serial()?;

            let result = if message.message_type == MessageType::Error {
                let name = message.error_name().unwrap_or("").to_string();
                let text = message
                    .body
                    .arguments
                    .get(0)
                    .and_then(Type::as_str)
                    .unwrap_or("")
                    .to_string();
                Err(Error::Remote {
                    name,
                    message: text,
                })
            } else {
                Ok(message)
            };

            let waiter = lock(&inner.state).pending.remove(&reply_serial);
            match waiter {
                Some(sender) => {
                    let _ = sender.try_send(result);
                }
                None => {
                    log::trace!("No pending call for reply serial {}; dropping.", reply_serial);
                }
            }
            None
        }
        MessageType::Signal => {
            let signal = SignalMessage::from_message(&message)?;

            let mut state = lock(&inner.state);
            state.subscriptions.retain(|subscription| {
                if !subscription.filter.matches(&message) {
                    return true;
                }
                match subscription.sender.try_send(signal.clone()) {
                    Ok(()) => true,
                    Err(smol::channel::TrySendError::Full(rejected)) => {
                        // Slow consumer: evict the oldest queued signal and
                        // record the overflow.
                        let _ = subscription.stealer.try_recv();
                        subscription.overflowed.store(true, Ordering::Relaxed);
                        if subscription.sender.try_send(rejected).is_err() {
                            log::warn!("Dropped a signal for subscription {}.", subscription.id);
                        }
                        true
                    }
                    Err(smol::channel::TrySendError::Closed(_)) => false,
                }
            });
            None
        }
        MessageType::MethodCall => {
            log::debug!(
                "Unexpected method call {:?} on a client connection.",
                message.member()
            );
            if message.flag_no_reply_expected {
                return None;
            }
            Some(Message::error(
                inner.next_serial(),
                message.serial,
                "org.freedesktop.DBus.Error.NotSupported",
                "this connection does not export any objects",
            ))
        }
    }
}

/// The line-based SASL exchange that precedes the binary protocol.
struct Handshake<'a> {
    socket: &'a Socket,
    recv_buffer: Vec<u8>,
}

impl<'a> Handshake<'a> {
    fn new(socket: &'a Socket) -> Self {
        Self {
            socket,
            recv_buffer: Vec::new(),
        }
    }

    /// `AUTH EXTERNAL` with the effective uid rendered in decimal and then
    /// hex-encoded, which is the shape the auth protocol wants.
    async fn auth(&mut self) -> crate::Result<()> {
        let uid = nix::unistd::geteuid().as_raw().to_string();
        self.write_line(format!("AUTH EXTERNAL {}", hex::encode(uid)))
            .await?;

        let line = self.read_line().await?;
        if !line.starts_with("OK") {
            return Err(Error::Auth(format!("server rejected AUTH: {:?}", line)));
        }
        Ok(())
    }

    /// Ask for fd passing. Refusal is fine; `h` values just become
    /// unavailable.
    async fn negotiate_unix_fd(&mut self) -> crate::Result<bool> {
        self.write_line("NEGOTIATE_UNIX_FD").await?;

        let line = self.read_line().await?;
        if line == "AGREE_UNIX_FD" {
            Ok(true)
        } else if line.starts_with("ERROR") {
            log::debug!("Server declined fd passing.");
            Ok(false)
        } else {
            Err(Error::Auth(format!(
                "unexpected NEGOTIATE_UNIX_FD reply: {:?}",
                line
            )))
        }
    }

    async fn begin(&mut self) -> crate::Result<()> {
        self.write_line("BEGIN").await
    }

    /// Bytes read past the last auth line; they belong to the binary
    /// protocol.
    fn finish(self) -> Vec<u8> {
        self.recv_buffer
    }

    /// Write one line; the \r\n ending is added here.
    async fn write_line<T: AsRef<str>>(&mut self, line: T) -> crate::Result<()> {
        let line = line.as_ref();
        log::debug!("C: {}", line);

        self.socket
            .send_all(format!("{}\r\n", line).as_bytes(), &[])
            .await
    }

    /// Read one \r\n-delimited line, without the line ending.
    async fn read_line(&mut self) -> crate::Result<String> {
        loop {
            if let Some(i) = self.recv_buffer.iter().position(|b| *b == b'\n') {
                if i == 0 || self.recv_buffer[i - 1] != b'\r' {
                    return Err(Error::Auth("invalid line ending in handshake".into()));
                }
                let line_bytes: Vec<u8> = self.recv_buffer.drain(..=i).collect();
                let line = std::str::from_utf8(&line_bytes[..line_bytes.len() - 2])
                    .map_err(|err| Error::Auth(err.to_string()))?
                    .to_string();
                log::debug!("S: {}", line);
                return Ok(line);
            }

            let mut buf = [0u8; 64];
            let (read, fds) = self.socket.recvmsg(&mut buf).await?;
            if !fds.is_empty() {
                return Err(Error::Auth("unexpected fds during handshake".into()));
            }
            if read == 0 {
                return Err(Error::Auth("unexpected EOF during handshake".into()));
            }
            self.recv_buffer.extend_from_slice(&buf[..read]);
        }
    }
}

/// An in-process peer speaking the bus side of the protocol over a socket
/// pair, for exercising the connection without a real daemon.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct MockBus {
        pub(crate) socket: Socket,
        buf: Vec<u8>,
        fds: Vec<RawFd>,
        serial: u32,
    }

    impl MockBus {
        /// Serve the server side of the handshake and the Hello exchange,
        /// assigning `:1.42`.
        pub(crate) async fn accept(socket: Socket) -> Self {
            let mut bus = MockBus {
                socket,
                buf: Vec::new(),
                fds: Vec::new(),
                serial: 0,
            };

            let auth = bus.read_line().await;
            assert!(auth.starts_with("AUTH EXTERNAL"), "got {:?}", auth);
            bus.write_raw(b"OK 0123456789abcdef0123456789abcdef\r\n").await;

            assert_eq!(bus.read_line().await, "NEGOTIATE_UNIX_FD");
            bus.write_raw(b"AGREE_UNIX_FD\r\n").await;

            assert_eq!(bus.read_line().await, "BEGIN");

            let hello = bus.read_message().await;
            assert_eq!(hello.member(), Some("Hello"));
            let serial = bus.next_serial();
            bus.send(Message::method_return(
                serial,
                hello.serial,
                Body::new(vec![DBusString::new(":1.42").into()]),
            ))
            .await;

            bus
        }

        pub(crate) fn next_serial(&mut self) -> NonZeroU32 {
            self.serial += 1;
            NonZeroU32::new(self.serial).unwrap()
        }

        pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
            self.socket.send_all(bytes, &[]).await.unwrap();
        }

        async fn fill(&mut self) {
            let mut chunk = [0u8; 1024];
            let (read, fds) = self.socket.recvmsg(&mut chunk).await.unwrap();
            assert!(read > 0, "client hung up");
            self.buf.extend_from_slice(&chunk[..read]);
            self.fds.extend(fds);
        }

        async fn read_line(&mut self) -> String {
            loop {
                // The leading protocol null byte arrives glued to the first
                // auth line.
                if self.buf.first() == Some(&0) {
                    self.buf.remove(0);
                }
                if let Some(i) = self.buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.buf.drain(..=i).collect();
                    return std::str::from_utf8(&line[..line.len() - 2])
                        .unwrap()
                        .to_string();
                }
                self.fill().await;
            }
        }

        pub(crate) async fn read_message(&mut self) -> Message {
            while self.buf.len() < MIN_MESSAGE_SIZE {
                self.fill().await;
            }
            let total = frame_length(&self.buf[..MIN_MESSAGE_SIZE]).unwrap();
            while self.buf.len() < total {
                self.fill().await;
            }
            let frame: Vec<u8> = self.buf.drain(..total).collect();
            let message = Message::unmarshal(&frame, &self.fds).unwrap();
            let used = message.unix_fds().unwrap_or(0) as usize;
            self.fds.drain(..used);
            message
        }

        pub(crate) async fn send(&mut self, message: Message) {
            let (bytes, fds) = message.marshal(Endianness::native()).unwrap();
            self.socket.send_all(&bytes, &fds).await.unwrap();
        }

        /// Reply to the next method call with the given body.
        pub(crate) async fn answer_next(&mut self, body: Body) -> Message {
            let call = self.read_message().await;
            let serial = self.next_serial();
            self.send(Message::method_return(serial, call.serial, body))
                .await;
            call
        }
    }

    /// A connected client plus the mock bus serving it.
    pub(crate) async fn connected_pair() -> (Connection, MockBus) {
        let (client_socket, server_socket) = Socket::pair().unwrap();
        let server = smol::spawn(MockBus::accept(server_socket));
        let connection = Connection::with_socket(client_socket).await.unwrap();
        let bus = server.await;
        (connection, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn hello_records_the_unique_name() {
        smol::block_on(async {
            let (connection, _bus) = connected_pair().await;
            assert_eq!(connection.unique_name().as_deref(), Some(":1.42"));
            assert!(connection.can_pass_unix_fd());
            connection.close().await;
        });
    }

    #[test]
    fn replies_correlate_by_serial_regardless_of_arrival_order() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let first = {
                let connection = connection.clone();
                smol::spawn(async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "One", Body::default()))
                        .await
                })
            };
            let second = {
                let connection = connection.clone();
                smol::spawn(async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "Two", Body::default()))
                        .await
                })
            };

            let call_a = bus.read_message().await;
            let call_b = bus.read_message().await;

            // Answer in reverse order, echoing each call's member so the
            // callers can tell which reply they got.
            for call in &[&call_b, &call_a] {
                let serial = bus.next_serial();
                let member = call.member().unwrap().to_string();
                bus.send(Message::method_return(
                    serial,
                    call.serial,
                    Body::new(vec![DBusString::new(member).into()]),
                ))
                .await;
            }

            let reply_one = first.await.unwrap();
            let reply_two = second.await.unwrap();
            assert_eq!(reply_one.body.arguments[0].as_str(), Some("One"));
            assert_eq!(reply_two.body.arguments[0].as_str(), Some("Two"));
            assert_eq!(connection.pending_len(), 0);

            connection.close().await;
        });
    }

    #[test]
    fn cancelled_call_detaches_and_a_late_reply_is_dropped() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let call_future = {
                let connection = connection.clone();
                async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "Slow", Body::default()))
                        .await
                }
            };

            // Run the call only until the bus has received it, then drop it
            // unanswered.
            let received = smol::future::or(
                async { Some(bus.read_message().await) },
                async {
                    let _ = call_future.await;
                    None
                },
            )
            .await;
            let call = received.unwrap();

            // The waiter is gone.
            assert_eq!(connection.pending_len(), 0);

            // A late reply must be silently discarded...
            let serial = bus.next_serial();
            bus.send(Message::method_return(serial, call.serial, Body::default()))
                .await;

            // ...and the connection keeps working afterwards.
            let after = {
                let connection = connection.clone();
                smol::spawn(async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "After", Body::default()))
                        .await
                })
            };
            bus.answer_next(Body::default()).await;
            assert!(after.await.is_ok());

            connection.close().await;
        });
    }

    #[test]
    fn overlapping_subscriptions_each_see_every_match_in_order() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let by_interface = connection
                .subscribe(SignalFilter {
                    interface: Some("com.example.Iface".into()),
                    ..SignalFilter::default()
                })
                .unwrap();
            let by_member = connection
                .subscribe(SignalFilter {
                    member: Some("Ping".into()),
                    ..SignalFilter::default()
                })
                .unwrap();

            for n in 1..=3u32 {
                let serial = bus.next_serial();
                bus.send(Message::signal(
                    serial,
                    "/obj",
                    "com.example.Iface",
                    "Ping",
                    Body::new(vec![DBusUint32 { u32: n }.into()]),
                ))
                .await;
            }

            for handle in &[&by_interface, &by_member] {
                for n in 1..=3u32 {
                    let signal = handle.receiver.recv().await.unwrap();
                    assert_eq!(signal.member, "Ping");
                    assert_eq!(signal.body[0].as_u32(), Some(n));
                }
            }

            connection.close().await;

            // Teardown closes the queues.
            assert!(by_interface.receiver.recv().await.is_err());
        });
    }

    #[test]
    fn a_slow_subscriber_loses_the_oldest_signals() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let handle = connection
                .subscribe(SignalFilter {
                    member: Some("Tick".into()),
                    ..SignalFilter::default()
                })
                .unwrap();

            let extra = 5u32;
            let total = (SIGNAL_QUEUE_CAPACITY as u32) + extra;
            for n in 1..=total {
                let serial = bus.next_serial();
                bus.send(Message::signal(
                    serial,
                    "/obj",
                    "com.example.Iface",
                    "Tick",
                    Body::new(vec![DBusUint32 { u32: n }.into()]),
                ))
                .await;
            }

            // A call round-trip orders us after every signal dispatch.
            let barrier = {
                let connection = connection.clone();
                smol::spawn(async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "Sync", Body::default()))
                        .await
                })
            };
            bus.answer_next(Body::default()).await;
            barrier.await.unwrap();

            assert!(handle.overflowed.load(Ordering::Relaxed));

            // The oldest signals fell off; the first one left is extra+1.
            let first = handle.receiver.recv().await.unwrap();
            assert_eq!(first.body[0].as_u32(), Some(extra + 1));

            connection.close().await;
        });
    }

    #[test]
    fn peer_hangup_fails_pending_and_later_calls() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let stuck = {
                let connection = connection.clone();
                smol::spawn(async move {
                    connection
                        .call(MethodCall::new("dest.x", "/x", None, "Never", Body::default()))
                        .await
                })
            };
            let _ = bus.read_message().await;
            drop(bus);

            let result = stuck.await;
            assert!(matches!(result, Err(Error::Disconnected)), "{:?}", result);

            let again = connection
                .call(MethodCall::new("dest.x", "/x", None, "Again", Body::default()))
                .await;
            assert!(matches!(again, Err(Error::Disconnected)));
        });
    }

    #[test]
    fn stray_method_calls_are_answered_with_not_supported() {
        smol::block_on(async {
            let (connection, mut bus) = connected_pair().await;

            let serial = bus.next_serial();
            bus.send(Message::method_call(
                MethodCall::new(":1.42", "/obj", None, "Poke", Body::default()),
                serial,
            ))
            .await;

            let reply = bus.read_message().await;
            assert_eq!(reply.message_type, MessageType::Error);
            assert_eq!(
                reply.error_name(),
                Some("org.freedesktop.DBus.Error.NotSupported")
            );
            assert_eq!(reply.reply_serial(), Some(serial.get()));

            connection.close().await;
        });
    }
}
