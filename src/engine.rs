//! Device side protocol engine.
//!
//! Processes one packet at a time: decode, dispatch, respond. The only
//! state carried between packets is the [`Session`] write cursor, which
//! lives from bootloader entry until reset or application hand-off.

use crate::codec::{read_packet, send_packet, send_string_packet};
use crate::flash::FlashStore;
use crate::protocol::{Command, Packet, PacketStatus, EMPTY_PAYLOAD};
use crate::transport::Transport;
use crate::Error;

/// Default inter-byte receive timeout
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u32 = 500;

/// Default number of consecutive transport faults tolerated by [`Engine::run`]
pub const DEFAULT_MAX_TRANSPORT_ERRORS: u32 = 16;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Accepting requests
    Idle,
    /// Control handed to the application, no further packets are processed
    Terminal,
}

#[derive(Clone, PartialEq, Debug)]
pub struct EngineOptions {
    /// Reported in `PlatformResponse`
    pub platform: &'static str,
    /// Reported in `VersionResponse`
    pub version: &'static str,
    /// Receive timeout for each byte of a packet
    pub receive_timeout_ms: u32,
    /// Consecutive transport faults after which `run` gives up, 0 for no limit
    pub max_transport_errors: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            platform: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            max_transport_errors: DEFAULT_MAX_TRANSPORT_ERRORS,
        }
    }
}

/// Flash write position for one update session
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Session {
    cursor: u32,
}

impl Session {
    pub fn new(cursor: u32) -> Self {
        Self { cursor }
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }
}

#[derive(Debug, thiserror::Error)]
enum Rejection<E: core::fmt::Debug> {
    #[error("packet not verified")]
    Unverified,

    #[error("{len} bytes at 0x{cursor:08x} exceed application region")]
    OutOfRange { cursor: u32, len: usize },

    #[error("erase failed: {0:?}")]
    Erase(E),

    #[error("write failed: {0:?}")]
    Write(E),
}

pub struct Engine<T, F> {
    state: State,
    options: EngineOptions,
    session: Session,
    transport: T,
    flash: F,
}

impl<T, F> Engine<T, F>
where
    T: Transport,
    F: FlashStore,
{
    /// Create an engine with a fresh session at the start of the
    /// application region
    pub fn new(transport: T, flash: F, options: EngineOptions) -> Self {
        let session = Session::new(flash.app_region().start);
        Self::with_session(transport, flash, options, session)
    }

    pub fn with_session(transport: T, flash: F, options: EngineOptions, session: Session) -> Self {
        Self {
            state: State::Idle,
            options,
            session,
            transport,
            flash,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn release(self) -> (T, F) {
        (self.transport, self.flash)
    }

    /// Process requests until control is handed to the application.
    ///
    /// Returns the last error once `max_transport_errors` transport faults
    /// occur back to back, leaving recovery (typically a reset) to the
    /// caller. The session is kept so `run` may be called again.
    pub fn run(&mut self) -> Result<(), Error<T::Error>> {
        info!("Bootloader ready");

        let mut faults = 0;

        loop {
            match self.poll() {
                Ok(State::Terminal) => return Ok(()),
                Ok(State::Idle) => faults = 0,
                Err(e) => {
                    faults += 1;
                    error!("Transport error ({}): {:?}", faults, e);

                    if self.options.max_transport_errors != 0
                        && faults >= self.options.max_transport_errors
                    {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Receive and handle a single packet
    pub fn poll(&mut self) -> Result<State, Error<T::Error>> {
        if self.state == State::Terminal {
            return Ok(State::Terminal);
        }

        let packet = read_packet(&mut self.transport, self.options.receive_timeout_ms)
            .map_err(Error::Serial)?;

        self.handle(&packet)?;

        Ok(self.state)
    }

    /// Dispatch a decoded packet and send the response
    pub fn handle(&mut self, packet: &Packet) -> Result<(), Error<T::Error>> {
        match packet.status {
            PacketStatus::Incomplete => {
                trace!("Incomplete packet discarded");
                Ok(())
            }
            PacketStatus::Bad if packet.command == Command::WriteDataRequest as u8 => {
                warn!("Corrupt write request at 0x{:08x}", self.session.cursor);
                self.respond(Command::WriteDataResponseErr)
            }
            PacketStatus::Bad => {
                debug!("Bad packet (command 0x{:02x})", packet.command);
                self.respond(Command::BadPacketResponse)
            }
            PacketStatus::Ok => match packet.kind() {
                Some(Command::PlatformRequest) => {
                    debug!("Platform request");
                    send_string_packet(
                        &mut self.transport,
                        Command::PlatformResponse as u8,
                        self.options.platform,
                    )
                }
                Some(Command::VersionRequest) => {
                    debug!("Version request");
                    send_string_packet(
                        &mut self.transport,
                        Command::VersionResponse as u8,
                        self.options.version,
                    )
                }
                Some(Command::WriteDataRequest) => self.write_data(packet),
                Some(Command::StartAppRequest) => self.start_app(),
                _ => {
                    warn!("Unrecognized command 0x{:02x}", packet.command);
                    self.respond(Command::BadPacketResponse)
                }
            },
        }
    }

    fn respond(&mut self, command: Command) -> Result<(), Error<T::Error>> {
        send_packet(&mut self.transport, command as u8, &EMPTY_PAYLOAD)
    }

    fn write_data(&mut self, packet: &Packet) -> Result<(), Error<T::Error>> {
        let cursor = self.session.cursor;

        let response = match self.flash_write(packet) {
            Ok(end) => {
                debug!("Wrote {} bytes at 0x{:08x}", packet.data_size(), cursor);
                self.session.cursor = end;
                Command::WriteDataResponseOk
            }
            Err(e) => {
                warn!("Write at 0x{:08x} rejected: {}", cursor, e);
                Command::WriteDataResponseErr
            }
        };

        self.respond(response)
    }

    /// Erase and program the packet payload at the cursor, returning the
    /// new cursor. The session is not touched.
    fn flash_write(&mut self, packet: &Packet) -> Result<u32, Rejection<F::Error>> {
        if packet.status != PacketStatus::Ok {
            return Err(Rejection::Unverified);
        }

        let data = packet.data();
        let start = self.session.cursor;
        let region = self.flash.app_region();

        let end = match start.checked_add(data.len() as u32) {
            Some(end) if start >= region.start && end <= region.end => end,
            _ => {
                return Err(Rejection::OutOfRange {
                    cursor: start,
                    len: data.len(),
                })
            }
        };

        let page_size = self.flash.page_size().max(1);
        let mut page = self.flash.page_base(start);
        while page < end {
            self.flash
                .erase_if_needed(page.max(start))
                .map_err(Rejection::Erase)?;

            page = match page.checked_add(page_size) {
                Some(p) => p,
                None => break,
            };
        }

        self.flash.write_at(start, data).map_err(Rejection::Write)?;

        Ok(end)
    }

    /// Commit the image and hand off. A failed commit is answered with
    /// `BadPacketResponse` and the engine stays idle.
    fn start_app(&mut self) -> Result<(), Error<T::Error>> {
        if let Err(e) = self.flash.finalize() {
            error!("Failed to finalize image: {:?}", e);
            return self.respond(Command::BadPacketResponse);
        }

        info!(
            "Image complete ({} bytes), starting application",
            self.session.cursor.saturating_sub(self.flash.app_region().start)
        );

        self.respond(Command::StartAppResponse)?;
        self.transport.flush()?;

        self.state = State::Terminal;
        self.flash.start_application();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ops::Range;

    use crate::codec::encode;
    use crate::flash::{FlashError, MemFlash};
    use crate::mock::{MockPort, NoDelay};
    use crate::protocol::MAX_PACKET_SIZE;
    use crate::transport::HalTransport;

    const BASE: u32 = 0x1000;
    const PAGE: u32 = 128;

    type TestEngine<F> = Engine<HalTransport<MockPort, NoDelay>, F>;

    fn packet(command: u8, data: &[u8]) -> Vec<u8> {
        let mut buff = [0u8; MAX_PACKET_SIZE];
        let n = encode(command, data, &mut buff).unwrap();
        buff[..n].to_vec()
    }

    fn options() -> EngineOptions {
        EngineOptions {
            platform: "pic24fj1024",
            version: "v1.2",
            receive_timeout_ms: 10,
            max_transport_errors: 3,
        }
    }

    fn engine(rx: &[u8]) -> TestEngine<MemFlash> {
        let t = HalTransport::new(MockPort::with_rx(rx), NoDelay, 1);
        Engine::new(t, MemFlash::new(BASE, PAGE, 8), options())
    }

    fn push<F: FlashStore>(e: &mut TestEngine<F>, bytes: &[u8]) {
        e.transport_mut().port_mut().push_rx(bytes);
    }

    /// Decode everything the engine has sent so far
    fn responses<F: FlashStore>(e: &mut TestEngine<F>) -> Vec<Packet> {
        let tx = std::mem::take(&mut e.transport_mut().port_mut().tx);
        let mut t = HalTransport::new(MockPort::with_rx(&tx), NoDelay, 1);

        let mut out = vec![];
        loop {
            let p = read_packet(&mut t, 1).unwrap();
            if p.status == PacketStatus::Incomplete {
                return out;
            }
            out.push(p);
        }
    }

    fn reply(command: Command) -> Packet {
        Packet::new(command as u8, &EMPTY_PAYLOAD).unwrap()
    }

    #[test]
    fn platform_and_version() {
        let mut rx = packet(0x00, &[0]);
        rx.extend(packet(0x02, &[0]));
        let mut e = engine(&rx);

        assert_eq!(e.poll(), Ok(State::Idle));
        assert_eq!(e.poll(), Ok(State::Idle));

        assert_eq!(
            responses(&mut e),
            vec![
                Packet::new(0x01, b"pic24fj1024").unwrap(),
                Packet::new(0x03, b"v1.2").unwrap(),
            ]
        );
    }

    #[test]
    fn empty_request_is_bad() {
        let mut e = engine(&packet(0x00, &[]));

        e.poll().unwrap();
        assert_eq!(responses(&mut e), vec![reply(Command::BadPacketResponse)]);
    }

    #[test]
    fn incomplete_sends_nothing() {
        let mut e = engine(&packet(0x04, &[1, 2, 3])[..4]);

        assert_eq!(e.poll(), Ok(State::Idle));
        assert!(responses(&mut e).is_empty());
        assert_eq!(e.session().cursor(), BASE);
        assert_eq!(e.flash().erase_count(), 0);
    }

    #[test]
    fn write_advances_cursor() {
        let data: Vec<u8> = (0..64).collect();
        let mut rx = packet(0x04, &data);
        rx.extend(packet(0x04, &data));
        let mut e = engine(&rx);

        e.poll().unwrap();
        e.poll().unwrap();

        assert_eq!(e.session().cursor(), BASE + 128);
        assert_eq!(
            responses(&mut e),
            vec![
                reply(Command::WriteDataResponseOk),
                reply(Command::WriteDataResponseOk)
            ]
        );
        assert_eq!(e.flash().read(BASE, 64), Some(&data[..]));
        assert_eq!(e.flash().read(BASE + 64, 64), Some(&data[..]));
        assert_eq!(e.flash().erase_count(), 1);
    }

    #[test]
    fn write_across_pages_erases_each() {
        let data = [0xA5u8; 200];
        let (t, f) = engine(&packet(0x04, &data)).release();
        let mut e = Engine::with_session(t, f, options(), Session::new(BASE + 100));

        e.poll().unwrap();

        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseOk)]);
        assert_eq!(e.session().cursor(), BASE + 300);
        assert_eq!(e.flash().erase_count(), 3);
        assert_eq!(e.flash().read(BASE + 100, 200), Some(&data[..]));
    }

    #[test]
    fn failed_write_keeps_cursor() {
        let data = [0x11u8; 32];
        let mut e = engine(&packet(0x04, &data));
        e.flash_mut().fail_next_writes(1);

        e.poll().unwrap();
        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseErr)]);
        assert_eq!(e.session().cursor(), BASE);

        // Retry lands at the same address
        push(&mut e, &packet(0x04, &data));
        e.poll().unwrap();
        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseOk)]);
        assert_eq!(e.session().cursor(), BASE + 32);
        assert_eq!(e.flash().read(BASE, 32), Some(&data[..]));
    }

    #[test]
    fn corrupt_write_never_touches_flash() {
        let mut rx = packet(0x04, &[1, 2, 3, 4]);
        let last = rx.len() - 1;
        rx[last] ^= 0x01;
        let mut e = engine(&rx);

        e.poll().unwrap();

        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseErr)]);
        assert_eq!(e.session().cursor(), BASE);
        assert_eq!(e.flash().erase_count(), 0);
    }

    #[test]
    fn write_past_region_rejected() {
        let e = engine(&[]);
        let end = e.flash().app_region().end;
        let (t, f) = e.release();
        let mut e = Engine::with_session(t, f, options(), Session::new(end - 16));

        push(&mut e, &packet(0x04, &[0u8; 17]));
        e.poll().unwrap();
        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseErr)]);
        assert_eq!(e.session().cursor(), end - 16);

        push(&mut e, &packet(0x04, &[0u8; 16]));
        e.poll().unwrap();
        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseOk)]);
        assert_eq!(e.session().cursor(), end);
    }

    #[test]
    fn unrecognized_commands() {
        for c in &[0x09u8, 0x42, 0xFE, 0x01, 0x05, 0xFF] {
            let mut e = engine(&packet(*c, &[0xAA, 0xBB]));

            e.poll().unwrap();

            assert_eq!(responses(&mut e), vec![reply(Command::BadPacketResponse)]);
            assert_eq!(e.flash().erase_count(), 0);
            assert_eq!(e.session().cursor(), BASE);
        }
    }

    #[test]
    fn start_app_is_terminal() {
        let mut rx = packet(0x07, &[0]);
        rx.extend(packet(0x00, &[0]));
        let mut e = engine(&rx);

        assert_eq!(e.poll(), Ok(State::Terminal));
        assert!(e.flash().started());
        assert_eq!(responses(&mut e), vec![reply(Command::StartAppResponse)]);

        // Nothing further is read
        assert_eq!(e.poll(), Ok(State::Terminal));
        assert!(responses(&mut e).is_empty());
        assert_eq!(e.transport_mut().port_mut().rx.len(), 4);
    }

    #[test]
    fn one_request_at_a_time() {
        let mut rx = packet(0x04, &[0x12; 16]);
        rx.extend(packet(0x07, &[0]));
        let mut e = engine(&rx);

        assert_eq!(e.poll(), Ok(State::Idle));
        assert!(!e.flash().started());
        assert_eq!(responses(&mut e), vec![reply(Command::WriteDataResponseOk)]);

        assert_eq!(e.poll(), Ok(State::Terminal));
        assert!(e.flash().started());
        assert_eq!(responses(&mut e), vec![reply(Command::StartAppResponse)]);
    }

    #[test]
    fn sessions_are_independent() {
        let mut a = engine(&packet(0x04, &[1u8; 10]));
        let mut b = engine(&packet(0x04, &[2u8; 20]));

        a.poll().unwrap();
        b.poll().unwrap();

        assert_eq!(a.session().cursor(), BASE + 10);
        assert_eq!(b.session().cursor(), BASE + 20);
    }

    #[test]
    fn run_until_hand_off() {
        let mut rx = packet(0x02, &[0]);
        rx.extend(packet(0x04, &[0x34; 8]));
        rx.extend(packet(0x07, &[0]));
        let mut e = engine(&rx);

        assert_eq!(e.run(), Ok(()));

        assert_eq!(e.state(), State::Terminal);
        assert_eq!(e.session().cursor(), BASE + 8);
        assert_eq!(responses(&mut e).len(), 3);
    }

    struct UnfinalizedFlash(MemFlash);

    impl FlashStore for UnfinalizedFlash {
        type Error = FlashError;

        fn page_size(&self) -> u32 {
            self.0.page_size()
        }

        fn app_region(&self) -> Range<u32> {
            self.0.app_region()
        }

        fn erase_if_needed(&mut self, address: u32) -> Result<(), FlashError> {
            self.0.erase_if_needed(address)
        }

        fn write_at(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
            self.0.write_at(address, data)
        }

        fn finalize(&mut self) -> Result<(), FlashError> {
            Err(FlashError::WriteFailed { address: BASE })
        }

        fn start_application(&mut self) {
            self.0.start_application()
        }
    }

    #[test]
    fn failed_finalize_stays_idle() {
        let t = HalTransport::new(MockPort::with_rx(&packet(0x07, &[0])), NoDelay, 1);
        let f = UnfinalizedFlash(MemFlash::new(BASE, PAGE, 1));
        let mut e = Engine::new(t, f, options());

        assert_eq!(e.poll(), Ok(State::Idle));
        assert!(!e.flash().0.started());
        assert_eq!(responses(&mut e), vec![reply(Command::BadPacketResponse)]);
    }

    #[test]
    fn run_gives_up_on_persistent_faults() {
        let mut e = engine(&[]);
        e.transport_mut().port_mut().fail_reads = true;

        assert_eq!(e.run(), Err(Error::Serial(())));
        assert_eq!(e.transport_mut().port_mut().polls, 3);
        assert_eq!(e.state(), State::Idle);
    }

    #[test]
    fn write_with_unaligned_base() {
        let t = HalTransport::new(MockPort::default(), NoDelay, 1);
        let mut e = Engine::new(t, MemFlash::new(0x10, 64, 4), options());
        let data = [0x5Cu8; 100];

        push(&mut e, &packet(0x04, &data));
        push(&mut e, &packet(0x04, &data));
        e.poll().unwrap();
        e.poll().unwrap();

        assert_eq!(
            responses(&mut e),
            vec![
                reply(Command::WriteDataResponseOk),
                reply(Command::WriteDataResponseOk)
            ]
        );
        assert_eq!(e.session().cursor(), 0x10 + 200);
        assert_eq!(e.flash().erase_count(), 4);
        assert_eq!(e.flash().read(0x10, 100), Some(&data[..]));
        assert_eq!(e.flash().read(0x10 + 100, 100), Some(&data[..]));
    }
}
