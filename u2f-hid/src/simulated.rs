//! In-memory security keys that speak the device side of the HID protocol.
//!
//! A [SimulatedKey] allocates channels, echoes pings, counts winks, honours locks and hands
//! every MSG payload to a caller supplied handler. [SimulatedFactory] makes keys visible for
//! discovery and can unplug them or report them busy.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::channel::{ChannelId, Channels, BROADCAST_CHANNEL_ID};
use crate::device::{DeviceFactory, HidDevice, OpenOutcome, ReportError};
use crate::message::{Message, Reassembler};
use crate::session::DeviceInfo;
use crate::{CapabilityFlags, CommandType, ErrorCode, INIT_NONCE_LEN};

const REPORT_LEN: usize = 64;
const PROTOCOL_VERSION: u8 = 2;

type MsgHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

struct KeyState {
    channels: Channels,
    capabilities: CapabilityFlags,
    lock_holder: Option<ChannelId>,
    winks: usize,
    messages: Vec<Vec<u8>>,
    open_handles: usize,
}

/// Device side of one simulated security key. Clones share the same key.
#[derive(Clone)]
pub struct SimulatedKey {
    state: Arc<Mutex<KeyState>>,
    connected: Arc<watch::Sender<bool>>,
    handler: MsgHandler,
}

impl SimulatedKey {
    /// A key answering every MSG request with whatever `handler` returns.
    pub fn new<H>(handler: H) -> SimulatedKey
    where
        H: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let (connected, _) = watch::channel(true);
        SimulatedKey {
            state: Arc::new(Mutex::new(KeyState {
                channels: Channels::new(),
                capabilities: CapabilityFlags::WINK | CapabilityFlags::LOCK,
                lock_holder: None,
                winks: 0,
                messages: Vec::new(),
                open_handles: 0,
            })),
            connected: Arc::new(connected),
            handler: Arc::new(handler),
        }
    }

    pub fn with_capabilities(self, capabilities: CapabilityFlags) -> SimulatedKey {
        self.state().capabilities = capabilities;
        self
    }

    /// Open a new handle to this key, as the operating system would.
    pub fn open(&self) -> SimulatedDevice {
        self.state().open_handles += 1;
        SimulatedDevice {
            key: self.clone(),
            connected: self.connected.subscribe(),
            reassembler: Reassembler::new(),
            pending: VecDeque::new(),
        }
    }

    /// Physically remove the key, every handle fails from now on.
    pub fn disconnect(&self) {
        self.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Hold the lock on behalf of some other client's channel.
    pub fn lock_for(&self, channel_id: ChannelId) {
        self.state().lock_holder = Some(channel_id);
    }

    pub fn wink_count(&self) -> usize {
        self.state().winks
    }

    /// Every MSG payload received so far, in order.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.state().messages.clone()
    }

    /// Handles opened and not yet dropped.
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    fn state(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, request: Message) -> Message {
        let channel_id = request.channel_id;
        let error = |code: ErrorCode| {
            Message::new(channel_id, CommandType::Error, vec![code.to_byte()])
        };

        if channel_id == BROADCAST_CHANNEL_ID {
            return match request.command {
                CommandType::Init if request.payload.len() == INIT_NONCE_LEN => {
                    let mut nonce = [0u8; INIT_NONCE_LEN];
                    nonce.copy_from_slice(&request.payload);
                    let mut state = self.state();
                    match state.channels.allocate() {
                        Some(new_channel_id) => {
                            let info = DeviceInfo {
                                channel_id: new_channel_id,
                                protocol_version: PROTOCOL_VERSION,
                                major_version: 1,
                                minor_version: 0,
                                build_version: 0,
                                capabilities: state.capabilities,
                            };
                            debug!(channel_id = ?new_channel_id, "Simulated key allocated channel");
                            Message::new(channel_id, CommandType::Init, info.encode(&nonce))
                        }
                        None => error(ErrorCode::Unspecified),
                    }
                }
                CommandType::Init => error(ErrorCode::InvalidLength),
                _ => error(ErrorCode::InvalidCommand),
            };
        }

        let mut state = self.state();
        if !state.channels.is_allocated(channel_id) {
            return error(ErrorCode::SyncFailed);
        }
        if matches!(state.lock_holder, Some(holder) if holder != channel_id) {
            return error(ErrorCode::Busy);
        }

        match request.command {
            CommandType::Ping => Message::new(channel_id, CommandType::Ping, request.payload),
            CommandType::Wink if state.capabilities.contains(CapabilityFlags::WINK) => {
                state.winks += 1;
                Message::new(channel_id, CommandType::Wink, Vec::new())
            }
            CommandType::Lock if request.payload.len() != 1 => error(ErrorCode::InvalidLength),
            CommandType::Lock if state.capabilities.contains(CapabilityFlags::LOCK) => {
                state.lock_holder = match request.payload[0] {
                    0 => None,
                    _ => Some(channel_id),
                };
                Message::new(channel_id, CommandType::Lock, Vec::new())
            }
            CommandType::Msg => {
                state.messages.push(request.payload.clone());
                drop(state);
                let response = (self.handler)(&request.payload);
                Message::new(channel_id, CommandType::Msg, response)
            }
            _ => error(ErrorCode::InvalidCommand),
        }
    }
}

/// An open handle to a [SimulatedKey].
pub struct SimulatedDevice {
    key: SimulatedKey,
    connected: watch::Receiver<bool>,
    reassembler: Reassembler,
    pending: VecDeque<Vec<u8>>,
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("connected", &*self.connected.borrow())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SimulatedDevice {
    fn queue(&mut self, response: Message) {
        match response.to_reports(REPORT_LEN) {
            Ok(reports) => self.pending.extend(reports),
            Err(err) => debug!(error = ?err, "Simulated key response does not fit in reports"),
        }
    }
}

#[async_trait]
impl HidDevice for SimulatedDevice {
    fn report_len(&self) -> usize {
        REPORT_LEN
    }

    async fn send_report(&mut self, report: &[u8]) -> Result<usize, ReportError> {
        if !*self.connected.borrow() {
            return Err(ReportError::Disconnected);
        }
        trace!(report = ?report, "Simulated key received report");

        match self.reassembler.push(report) {
            Ok(Some(request)) => {
                let response = self.key.handle(request);
                self.queue(response);
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = ?err, "Simulated key rejected report");
                if let Ok(channel_id) = ChannelId::read(&mut &report[..]) {
                    self.queue(Message::new(
                        channel_id,
                        CommandType::Error,
                        vec![ErrorCode::InvalidSequencing.to_byte()],
                    ));
                }
            }
        }
        Ok(report.len())
    }

    async fn receive_report(&mut self) -> Result<Vec<u8>, ReportError> {
        if !*self.connected.borrow() {
            return Err(ReportError::Disconnected);
        }
        if let Some(report) = self.pending.pop_front() {
            return Ok(report);
        }
        // Nothing to answer, a real device would block until unplugged
        let _ = self.connected.wait_for(|connected| !*connected).await;
        Err(ReportError::Disconnected)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let mut state = self.key.state();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

#[derive(Default)]
struct FactoryState {
    keys: BTreeMap<String, SimulatedKey>,
    busy: BTreeMap<String, usize>,
    opens: BTreeMap<String, usize>,
}

/// Discovery over a set of simulated keys, identified by name.
#[derive(Clone, Default)]
pub struct SimulatedFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl SimulatedFactory {
    pub fn new() -> SimulatedFactory {
        SimulatedFactory::default()
    }

    /// Make a key visible to discovery.
    pub fn plug(&self, name: &str, key: SimulatedKey) {
        self.state().keys.insert(name.to_string(), key);
    }

    /// Remove a key from discovery and disconnect its open handles.
    pub fn unplug(&self, name: &str) -> Option<SimulatedKey> {
        let key = self.state().keys.remove(name);
        if let Some(key) = &key {
            key.disconnect();
        }
        key
    }

    /// Report the next `count` attempts to open `name` as busy.
    pub fn set_busy(&self, name: &str, count: usize) {
        self.state().busy.insert(name.to_string(), count);
    }

    /// Attempts to open `name`, busy ones included.
    pub fn open_attempts(&self, name: &str) -> usize {
        self.state().opens.get(name).copied().unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceFactory for SimulatedFactory {
    type Identity = String;
    type Device = SimulatedDevice;

    async fn find_all(&self) -> Result<Vec<String>, ReportError> {
        Ok(self.state().keys.keys().cloned().collect())
    }

    async fn open(&self, identity: &String) -> Result<OpenOutcome<SimulatedDevice>, ReportError> {
        let mut state = self.state();
        *state.opens.entry(identity.clone()).or_insert(0) += 1;

        if let Some(busy) = state.busy.get_mut(identity) {
            if *busy > 0 {
                *busy -= 1;
                return Ok(OpenOutcome::Busy);
            }
        }

        match state.keys.get(identity) {
            Some(key) => Ok(OpenOutcome::Opened(key.open())),
            None => Err(ReportError::Disconnected),
        }
    }
}
