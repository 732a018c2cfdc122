//! Exchange orchestration: one command outstanding at a time, each awaited
//! against a timeout, with a fixed delay between commands.

use crate::protocol::{BatteryInfo, Command, ResponseFrame, VersionInfo};
use crate::transport::Transport;
use crate::{Error, Result};
use std::time::Duration;
use tokio::time::timeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);
/// The BMS needs a breather between commands or it drops the second one.
const INTER_COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of one command exchange.
///
/// The protocol has no correlation token, so responses are attributed to the
/// most recently sent command. That only holds while a single command is
/// outstanding, which this state tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    Connecting,
    AwaitingResponse(Command),
    Completed,
    Failed,
}

/// Result of a full read: version first, telemetry second.
#[derive(Debug, Clone)]
pub struct BmsData {
    pub version: VersionInfo,
    pub battery: BatteryInfo,
}

pub struct BmsClient<T: Transport> {
    transport: T,
    timeout: Duration,
    delay: Duration,
    state: ExchangeState,
}

impl<T: Transport> BmsClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            delay: INTER_COMMAND_DELAY,
            state: ExchangeState::Idle,
        }
    }

    /// Response timeout for each command.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Pause between consecutive commands in a multi-command read.
    pub fn set_delay(&mut self, delay: Duration) -> &mut Self {
        self.delay = delay;
        self
    }

    fn set_state(&mut self, state: ExchangeState) {
        log::trace!("Exchange state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Full read: `GetVersion`, a delay, then `GetBatteryInfo`.
    ///
    /// The connection is released on every exit path, including timeout and
    /// transport failure.
    pub async fn read_all(&mut self) -> Result<BmsData> {
        self.connect().await?;
        let result = self.read_all_inner().await;
        self.finish().await;
        result
    }

    async fn read_all_inner(&mut self) -> Result<BmsData> {
        let version = VersionInfo::decode(&self.exchange(Command::GetVersion).await?)?;
        tokio::time::sleep(self.delay).await;
        let battery = BatteryInfo::decode(&self.exchange(Command::GetBatteryInfo).await?)?;
        Ok(BmsData { version, battery })
    }

    /// Version information only.
    pub async fn read_version(&mut self) -> Result<VersionInfo> {
        self.connect().await?;
        let result = self.exchange(Command::GetVersion).await;
        self.finish().await;
        VersionInfo::decode(&result?)
    }

    /// Telemetry snapshot only.
    pub async fn read_battery_info(&mut self) -> Result<BatteryInfo> {
        self.connect().await?;
        let result = self.exchange(Command::GetBatteryInfo).await;
        self.finish().await;
        BatteryInfo::decode(&result?)
    }

    /// Raw serial-number payload. Known firmware never answers this command,
    /// so `Error::Timeout` is the expected outcome on most devices.
    pub async fn read_serial_number(&mut self) -> Result<Vec<u8>> {
        self.connect().await?;
        let result = self.exchange(Command::SerialNumber).await;
        self.finish().await;
        result
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_state(ExchangeState::Connecting);
        if let Err(error) = self.transport.connect().await {
            self.set_state(ExchangeState::Failed);
            self.transport.disconnect().await;
            self.set_state(ExchangeState::Idle);
            return Err(error.into());
        }
        self.set_state(ExchangeState::Idle);
        Ok(())
    }

    async fn finish(&mut self) {
        self.transport.disconnect().await;
        self.set_state(ExchangeState::Idle);
    }

    /// Send one command and wait for exactly one notification.
    ///
    /// Stale notifications left over from an earlier timed-out command
    /// cannot be attributed unambiguously, so they are drained and dropped
    /// before the write.
    async fn exchange(&mut self, command: Command) -> Result<Vec<u8>> {
        if let ExchangeState::AwaitingResponse(outstanding) = self.state {
            return Err(Error::Generic(format!(
                "Command {:?} still outstanding",
                outstanding
            )));
        }

        while let Ok(result) = timeout(Duration::ZERO, self.transport.notification()).await {
            match result {
                Ok(stale) => log::warn!("Discarding stale notification: {:02X?}", stale),
                Err(error) => {
                    log::warn!("Transport error while draining stale notifications: {}", error);
                    break;
                }
            }
        }

        let frame = command.request();
        log::trace!("Sending {:?}: {:02X?}", command, frame);
        self.set_state(ExchangeState::AwaitingResponse(command));
        if let Err(error) = self.transport.send(&frame).await {
            self.set_state(ExchangeState::Failed);
            return Err(error.into());
        }

        let raw = match timeout(self.timeout, self.transport.notification()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(error)) => {
                self.set_state(ExchangeState::Failed);
                return Err(error.into());
            }
            Err(_) => {
                self.set_state(ExchangeState::Failed);
                return Err(Error::Timeout(command));
            }
        };
        log::trace!("Received {} bytes: {:02X?}", raw.len(), raw);

        let result = Self::decode(command, &raw);
        self.set_state(match result {
            Ok(_) => ExchangeState::Completed,
            Err(_) => ExchangeState::Failed,
        });
        result
    }

    fn decode(command: Command, raw: &[u8]) -> Result<Vec<u8>> {
        let frame = ResponseFrame::decode(raw)?;
        if frame.command != command as u8 {
            log::warn!(
                "Response echoes command {:#04x}, expected {:#04x}",
                frame.command,
                command as u8
            );
        }
        Ok(frame.payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::collections::VecDeque;
    use std::future::pending;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Reply {
        Frame(Vec<u8>),
        Silence,
        Failure(String),
    }

    #[derive(Default)]
    struct Shared {
        sent: Vec<Vec<u8>>,
        disconnects: usize,
    }

    /// Scripted transport: each `send` arms the next scripted reply, so the
    /// stale-notification drain before a write never consumes it.
    struct MockTransport {
        replies: VecDeque<Reply>,
        inbox: VecDeque<Reply>,
        connect_error: Option<String>,
        shared: Arc<Mutex<Shared>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Reply>) -> (Self, Arc<Mutex<Shared>>) {
            let shared = Arc::new(Mutex::new(Shared::default()));
            (
                Self {
                    replies: replies.into(),
                    inbox: VecDeque::new(),
                    connect_error: None,
                    shared: shared.clone(),
                },
                shared,
            )
        }
    }

    impl Transport for MockTransport {
        async fn connect(&mut self) -> std::result::Result<(), TransportError> {
            match self.connect_error.take() {
                Some(message) => Err(TransportError(message)),
                None => Ok(()),
            }
        }

        async fn send(&mut self, frame: &[u8]) -> std::result::Result<(), TransportError> {
            self.shared.lock().unwrap().sent.push(frame.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.inbox.push_back(reply);
            }
            Ok(())
        }

        async fn notification(&mut self) -> std::result::Result<Vec<u8>, TransportError> {
            match self.inbox.pop_front() {
                Some(Reply::Frame(raw)) => Ok(raw),
                Some(Reply::Failure(message)) => Err(TransportError(message)),
                Some(Reply::Silence) | None => pending().await,
            }
        }

        async fn disconnect(&mut self) {
            self.shared.lock().unwrap().disconnects += 1;
        }
    }

    fn response(command: Command, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![
            0x00,
            0x00,
            (payload.len() as u8).wrapping_add(5),
            0x02,
            command as u8,
            0x55,
            0xAA,
            0x00,
        ];
        raw.extend_from_slice(payload);
        let checksum = raw.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        raw.push(checksum);
        raw
    }

    fn version_payload() -> Vec<u8> {
        let mut payload = vec![0u8; 10];
        payload[0] = 1;
        payload[2] = 4;
        payload[6..8].copy_from_slice(&2023u16.to_le_bytes());
        payload[8] = 5;
        payload[9] = 15;
        payload
    }

    fn battery_payload() -> Vec<u8> {
        let mut payload = vec![0u8; 96];
        payload[0..4].copy_from_slice(&13280u32.to_le_bytes());
        payload[4..8].copy_from_slice(&13275u32.to_le_bytes());
        payload[80..82].copy_from_slice(&2u16.to_le_bytes());
        payload[82..84].copy_from_slice(&85u16.to_le_bytes());
        payload
    }

    #[tokio::test]
    async fn test_read_all_sequences_commands() {
        let (transport, shared) = MockTransport::new(vec![
            Reply::Frame(response(Command::GetVersion, &version_payload())),
            Reply::Frame(response(Command::GetBatteryInfo, &battery_payload())),
        ]);
        let mut client = BmsClient::new(transport);
        client.set_delay(Duration::ZERO);
        let data = client.read_all().await.unwrap();
        assert_eq!(data.version.firmware_version(), "1.4.0");
        assert_eq!(data.battery.soc, 85);

        let shared = shared.lock().unwrap();
        assert_eq!(
            shared.sent,
            vec![
                Command::GetVersion.request().to_vec(),
                Command::GetBatteryInfo.request().to_vec(),
            ]
        );
        assert_eq!(shared.disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_classified_and_disconnected() {
        let (transport, shared) = MockTransport::new(vec![Reply::Silence]);
        let mut client = BmsClient::new(transport);
        client.set_timeout(Duration::from_secs(2));
        let error = client.read_all().await.unwrap_err();
        assert!(matches!(error, Error::Timeout(Command::GetVersion)));
        assert_eq!(error.error_code(), 2);

        let shared = shared.lock().unwrap();
        // The second command is never issued after the first one fails.
        assert_eq!(shared.sent.len(), 1);
        assert_eq!(shared.disconnects, 1);
    }

    #[tokio::test]
    async fn test_corrupted_response_is_checksum_error() {
        let mut raw = response(Command::GetBatteryInfo, &battery_payload());
        raw[20] ^= 0xFF;
        let (transport, shared) = MockTransport::new(vec![Reply::Frame(raw)]);
        let mut client = BmsClient::new(transport);
        let error = client.read_battery_info().await.unwrap_err();
        assert!(matches!(error, Error::ChecksumMismatch { .. }));
        assert_eq!(error.error_code(), 6);
        assert_eq!(shared.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_classified() {
        let (transport, shared) =
            MockTransport::new(vec![Reply::Failure("connection dropped".into())]);
        let mut client = BmsClient::new(transport);
        let error = client.read_version().await.unwrap_err();
        assert!(matches!(error, Error::Transport(_)));
        assert_eq!(error.error_code(), 4);
        assert_eq!(shared.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_transport() {
        let (mut transport, shared) = MockTransport::new(vec![]);
        transport.connect_error = Some("no adapter".into());
        let mut client = BmsClient::new(transport);
        let error = client.read_all().await.unwrap_err();
        assert!(matches!(error, Error::Transport(_)));

        let shared = shared.lock().unwrap();
        assert!(shared.sent.is_empty());
        assert!(shared.disconnects >= 1);
    }

    #[tokio::test]
    async fn test_stale_notification_discarded_before_write() {
        // A frame left over from an earlier timed-out command must not be
        // attributed to the next one.
        let (mut transport, shared) = MockTransport::new(vec![Reply::Frame(response(
            Command::GetVersion,
            &version_payload(),
        ))]);
        transport.inbox.push_back(Reply::Frame(response(
            Command::GetBatteryInfo,
            &battery_payload(),
        )));
        let mut client = BmsClient::new(transport);
        let version = client.read_version().await.unwrap();
        assert_eq!(version.firmware_version(), "1.4.0");
        assert_eq!(shared.lock().unwrap().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_error_does_not_fail_exchange() {
        let (mut transport, _) = MockTransport::new(vec![Reply::Frame(response(
            Command::GetVersion,
            &version_payload(),
        ))]);
        transport
            .inbox
            .push_back(Reply::Failure("stream hiccup".into()));
        let mut client = BmsClient::new(transport);
        let version = client.read_version().await.unwrap();
        assert_eq!(version.firmware_version(), "1.4.0");
    }

    #[tokio::test]
    async fn test_serial_number_returns_raw_payload() {
        let payload = vec![0x50, 0x51, 0x31, 0x32];
        let (transport, _) =
            MockTransport::new(vec![Reply::Frame(response(Command::SerialNumber, &payload))]);
        let mut client = BmsClient::new(transport);
        assert_eq!(client.read_serial_number().await.unwrap(), payload);
    }
}
