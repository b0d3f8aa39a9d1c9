//! Register and sign against a single key, retrying until the user confirms presence.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use u2f_hid::{CapabilityFlags, DeviceFactory, HidDevice, OpenOutcome, Session};

use crate::apdu::{
    self, KeyHandle, RegisterRequest, RegisterResponse, SignRequest, SignResponse, StatusWord,
};
use crate::config::ClientConfig;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    Failure,
    BadKeyHandle,
    TestOfUserPresenceRequired,
}

/// Outcome of one request against one key. The response is only present on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult<Req, Resp> {
    pub status: OperationStatus,
    pub request: Req,
    pub response: Option<Resp>,
}

impl<Req, Resp> OperationResult<Req, Resp> {
    pub fn success(request: Req, response: Resp) -> Self {
        OperationResult {
            status: OperationStatus::Success,
            request,
            response: Some(response),
        }
    }

    pub fn unsuccessful(status: OperationStatus, request: Req) -> Self {
        OperationResult {
            status,
            request,
            response: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

pub type RegisterResult = OperationResult<RegisterRequest, RegisterResponse>;
pub type SignResult = OperationResult<SignRequest, SignResponse>;

/// Application level operations issued to an initialized key. `first_attempt` is set only for
/// the first request issued to this key during an operation.
#[async_trait]
pub trait KeyOperations: Send + Sync + 'static {
    async fn register<D: HidDevice>(
        &self,
        key: &mut Session<D>,
        request: &RegisterRequest,
        first_attempt: bool,
    ) -> Result<RegisterResult, Error>;

    async fn sign<D: HidDevice>(
        &self,
        key: &mut Session<D>,
        request: &SignRequest,
        first_attempt: bool,
    ) -> Result<SignResult, Error>;
}

/// Raw U2F messages sent through MSG. Winks the key before its first attempt so the user knows
/// which one to touch.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApduOperations;

impl ApduOperations {
    pub async fn version<D: HidDevice>(key: &mut Session<D>) -> Result<String, Error> {
        let response = key.msg(&apdu::version_request()).await?;
        match apdu::split_status(&response)? {
            (data, StatusWord::NoError) => apdu::parse_version(data),
            (_, status) => {
                debug!(?status, "Version request failed");
                Err(Error::InvalidResponse("version request failed"))
            }
        }
    }

    async fn wink_if_supported<D: HidDevice>(key: &mut Session<D>) -> Result<(), Error> {
        let supported = key
            .info()
            .map_or(false, |info| info.capabilities.contains(CapabilityFlags::WINK));
        if !supported {
            return Ok(());
        }
        match key.wink().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_device_gone() => Err(err.into()),
            Err(err) => {
                warn!(error = ?err, "Wink failed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl KeyOperations for ApduOperations {
    async fn register<D: HidDevice>(
        &self,
        key: &mut Session<D>,
        request: &RegisterRequest,
        first_attempt: bool,
    ) -> Result<RegisterResult, Error> {
        if first_attempt {
            Self::wink_if_supported(key).await?;
        }
        let response = key.msg(&request.to_apdu()).await?;
        let (data, status) = apdu::split_status(&response)?;
        Ok(match status {
            StatusWord::NoError => {
                OperationResult::success(request.clone(), RegisterResponse::parse(data)?)
            }
            status => OperationResult::unsuccessful(unsuccessful_status(status), request.clone()),
        })
    }

    async fn sign<D: HidDevice>(
        &self,
        key: &mut Session<D>,
        request: &SignRequest,
        first_attempt: bool,
    ) -> Result<SignResult, Error> {
        if first_attempt {
            Self::wink_if_supported(key).await?;
        }
        let response = key.msg(&request.to_apdu()).await?;
        let (data, status) = apdu::split_status(&response)?;
        Ok(match status {
            StatusWord::NoError => {
                OperationResult::success(request.clone(), SignResponse::parse(data)?)
            }
            status => OperationResult::unsuccessful(unsuccessful_status(status), request.clone()),
        })
    }
}

fn unsuccessful_status(status: StatusWord) -> OperationStatus {
    match status {
        StatusWord::TestOfUserPresenceRequired => OperationStatus::TestOfUserPresenceRequired,
        StatusWord::InvalidKeyHandle => OperationStatus::BadKeyHandle,
        StatusWord::NoError | StatusWord::Other(_) => OperationStatus::Failure,
    }
}

/// Open the device, retrying while another process holds it, then allocate a channel.
pub async fn open_session<F: DeviceFactory>(
    factory: &F,
    identity: &F::Identity,
    config: &ClientConfig,
) -> Result<Session<F::Device>, Error> {
    let device = loop {
        match factory.open(identity).await? {
            OpenOutcome::Opened(device) => break device,
            OpenOutcome::Busy => {
                debug!(?identity, "Device busy, retrying open");
                tokio::time::sleep(config.open_retry_interval()).await;
            }
        }
    };
    let session = Session::open(device).await?;
    debug!(?identity, channel_id = ?session.channel_id(), "Opened key");
    Ok(session)
}

/// Keep registering with every candidate until one succeeds or the key goes away.
pub async fn register<F, O>(
    factory: &F,
    identity: &F::Identity,
    operations: &O,
    requests: &[RegisterRequest],
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<RegisterResult, Error>
where
    F: DeviceFactory,
    O: KeyOperations,
{
    if requests.is_empty() {
        return Err(Error::NoRequests);
    }
    cancellable(cancel, async {
        let mut key = open_session(factory, identity, config).await?;
        let mut first_attempt = true;
        loop {
            for request in requests {
                let attempt = operations.register(&mut key, request, first_attempt).await;
                first_attempt = false;
                if let Some(result) = failed_attempt_is_retried(attempt)? {
                    match result.status {
                        OperationStatus::Success => {
                            info!(?identity, "Registered");
                            return Ok(result);
                        }
                        status => debug!(?identity, ?status, "Register attempt unsuccessful"),
                    }
                }
            }
            tokio::time::sleep(config.attempt_interval()).await;
        }
    })
    .await
}

/// Keep signing with every candidate whose key handle this key has not rejected, until one
/// succeeds, all are rejected or the key goes away.
pub async fn sign<F, O>(
    factory: &F,
    identity: &F::Identity,
    operations: &O,
    requests: &[SignRequest],
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<SignResult, Error>
where
    F: DeviceFactory,
    O: KeyOperations,
{
    let last_request = match requests.last() {
        Some(request) => request,
        None => return Err(Error::NoRequests),
    };
    cancellable(cancel, async {
        let mut key = open_session(factory, identity, config).await?;
        let mut blacklist: HashSet<KeyHandle> = HashSet::new();
        let mut first_attempt = true;
        loop {
            for request in requests {
                if blacklist.contains(&request.key_handle) {
                    continue;
                }
                let attempt = operations.sign(&mut key, request, first_attempt).await;
                first_attempt = false;
                if let Some(result) = failed_attempt_is_retried(attempt)? {
                    match result.status {
                        OperationStatus::Success => {
                            info!(?identity, "Signed");
                            return Ok(result);
                        }
                        OperationStatus::BadKeyHandle => {
                            debug!(?identity, key_handle = ?request.key_handle, "Key handle rejected");
                            blacklist.insert(request.key_handle.clone());
                        }
                        OperationStatus::TestOfUserPresenceRequired => {}
                        OperationStatus::Failure => {
                            debug!(?identity, "Sign attempt failed");
                        }
                    }
                }
            }
            if requests
                .iter()
                .all(|request| blacklist.contains(&request.key_handle))
            {
                debug!(?identity, "Key rejected every key handle");
                return Ok(OperationResult::unsuccessful(
                    OperationStatus::Failure,
                    last_request.clone(),
                ));
            }
            tokio::time::sleep(config.attempt_interval()).await;
        }
    })
    .await
}

/// A vanished device ends the operation, anything else only fails this attempt.
fn failed_attempt_is_retried<T>(attempt: Result<T, Error>) -> Result<Option<T>, Error> {
    match attempt {
        Ok(result) => Ok(Some(result)),
        Err(err) if err.is_device_gone() => Err(err),
        Err(err) => {
            warn!(error = %err, "Attempt failed");
            Ok(None)
        }
    }
}

async fn cancellable<T, Fut>(cancel: &CancellationToken, operation: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use u2f_hid::simulated::{SimulatedFactory, SimulatedKey};

    use super::*;

    const NO_ERROR: [u8; 2] = [0x90, 0x00];
    const USER_PRESENCE_REQUIRED: [u8; 2] = [0x69, 0x85];
    const WRONG_DATA: [u8; 2] = [0x6a, 0x80];

    fn register_request(challenge: u8) -> RegisterRequest {
        RegisterRequest {
            challenge: [challenge; 32],
            application: [0xaa; 32],
        }
    }

    fn sign_request(key_handle: u8) -> SignRequest {
        SignRequest {
            challenge: [1; 32],
            application: [0xaa; 32],
            key_handle: KeyHandle::from_bytes(&[key_handle; 16]).unwrap(),
        }
    }

    fn register_response() -> Vec<u8> {
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&[0x04; 65]);
        bytes.push(2);
        bytes.extend_from_slice(&[7, 7]);
        bytes.extend_from_slice(&[0x30, 0x01, 0x00]);
        bytes.extend_from_slice(&[0x30, 0x00]);
        bytes.extend_from_slice(&NO_ERROR);
        bytes
    }

    fn sign_response() -> Vec<u8> {
        let mut bytes = vec![0x01, 0, 0, 0, 9, 0x30, 0x00];
        bytes.extend_from_slice(&NO_ERROR);
        bytes
    }

    /// Key handle byte of a sign request APDU.
    fn requested_key_handle(apdu: &[u8]) -> u8 {
        apdu[72]
    }

    /// Answers with user presence required `touches` times, then with `response`.
    fn touched_after(touches: usize, response: Vec<u8>) -> SimulatedKey {
        let calls = AtomicUsize::new(0);
        SimulatedKey::new(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < touches {
                USER_PRESENCE_REQUIRED.to_vec()
            } else {
                response.clone()
            }
        })
    }

    fn factory_with(key: SimulatedKey) -> SimulatedFactory {
        let factory = SimulatedFactory::new();
        factory.plug("key", key);
        factory
    }

    #[tokio::test(start_paused = true)]
    async fn register_waits_for_user_presence() {
        let key = touched_after(2, register_response());
        let factory = factory_with(key.clone());
        let requests = vec![register_request(1)];

        let start = Instant::now();
        let result = register(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &requests,
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.request, requests[0]);
        assert_eq!(result.response.unwrap().key_handle.as_ref(), &[7, 7]);
        assert_eq!(key.messages().len(), 3);
        assert_eq!(key.wink_count(), 1);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
        assert_eq!(key.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn register_tries_every_candidate() {
        let key = touched_after(1, register_response());
        let factory = factory_with(key.clone());
        let requests = vec![register_request(1), register_request(2)];

        let result = register(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &requests,
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.request, requests[1]);
        assert_eq!(key.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_blacklists_rejected_key_handles() {
        let key = SimulatedKey::new({
            let calls = AtomicUsize::new(0);
            move |apdu| match requested_key_handle(apdu) {
                1 => WRONG_DATA.to_vec(),
                _ if calls.fetch_add(1, Ordering::SeqCst) < 2 => USER_PRESENCE_REQUIRED.to_vec(),
                _ => sign_response(),
            }
        });
        let factory = factory_with(key.clone());
        let requests = vec![sign_request(1), sign_request(2)];

        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &requests,
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.request, requests[1]);
        assert_eq!(result.response.unwrap().counter, 9);
        let sent: Vec<u8> = key
            .messages()
            .iter()
            .map(|apdu| requested_key_handle(apdu))
            .collect();
        assert_eq!(sent, vec![1, 2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_fails_once_every_key_handle_is_rejected() {
        let key = SimulatedKey::new(|_| WRONG_DATA.to_vec());
        let factory = factory_with(key.clone());
        let requests = vec![sign_request(1), sign_request(2)];

        let start = Instant::now();
        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &requests,
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.status, OperationStatus::Failure);
        assert_eq!(result.request, requests[1]);
        assert!(result.response.is_none());
        assert_eq!(key.messages().len(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_response_only_fails_the_attempt() {
        let calls = AtomicUsize::new(0);
        let key = SimulatedKey::new(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![0x01, 0x90, 0x00]
            } else {
                sign_response()
            }
        });
        let factory = factory_with(key.clone());

        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[sign_request(1)],
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(key.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unplugged_key_ends_the_operation() {
        let key = SimulatedKey::new(|_| USER_PRESENCE_REQUIRED.to_vec());
        let factory = factory_with(key.clone());
        tokio::spawn({
            let factory = factory.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                factory.unplug("key");
            }
        });

        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[sign_request(1)],
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.unwrap_err().is_device_gone());
        assert_eq!(key.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_is_opened_again() {
        let key = touched_after(0, sign_response());
        let factory = factory_with(key);
        factory.set_busy("key", 2);

        let start = Instant::now();
        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[sign_request(1)],
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(factory.open_attempts("key"), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn no_requests_never_opens_the_device() {
        let factory = factory_with(touched_after(0, sign_response()));
        let identity = "key".to_string();
        let cancel = CancellationToken::new();

        assert_matches!(
            sign(&factory, &identity, &ApduOperations, &[], &ClientConfig::default(), &cancel)
                .await,
            Err(Error::NoRequests)
        );
        assert_matches!(
            register(&factory, &identity, &ApduOperations, &[], &ClientConfig::default(), &cancel)
                .await,
            Err(Error::NoRequests)
        );
        assert_eq!(factory.open_attempts("key"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_the_device() {
        let key = SimulatedKey::new(|_| USER_PRESENCE_REQUIRED.to_vec());
        let factory = factory_with(key.clone());
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            }
        });

        let result = register(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[register_request(1)],
            &ClientConfig::default(),
            &cancel,
        )
        .await;

        assert_matches!(result, Err(Error::Cancelled));
        assert_eq!(key.open_handles(), 0);
        assert!(key.messages().len() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn winks_only_when_supported() {
        let key = touched_after(0, sign_response()).with_capabilities(CapabilityFlags::LOCK);
        let factory = factory_with(key.clone());

        sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[sign_request(1)],
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(key.wink_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn winks_once_per_operation() {
        let key = SimulatedKey::new(|_| USER_PRESENCE_REQUIRED.to_vec());
        let factory = factory_with(key.clone());
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(450)).await;
                cancel.cancel();
            }
        });

        let result = sign(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &[sign_request(1), sign_request(2), sign_request(3)],
            &ClientConfig::default(),
            &cancel,
        )
        .await;

        assert_matches!(result, Err(Error::Cancelled));
        // Three passes over three candidates at 0, 200ms and 400ms
        assert_eq!(key.messages().len(), 9);
        assert_eq!(key.wink_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_winks_once_for_all_candidates() {
        let key = touched_after(3, register_response());
        let factory = factory_with(key.clone());
        let requests = vec![register_request(1), register_request(2), register_request(3)];

        let result = register(
            &factory,
            &"key".to_string(),
            &ApduOperations,
            &requests,
            &ClientConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.request, requests[0]);
        assert_eq!(key.messages().len(), 4);
        assert_eq!(key.wink_count(), 1);
    }

    #[tokio::test]
    async fn version() {
        let key = SimulatedKey::new(|_| {
            let mut response = apdu::U2F_V2.as_bytes().to_vec();
            response.extend_from_slice(&NO_ERROR);
            response
        });
        let mut session = Session::open(key.open()).await.unwrap();

        assert_eq!(ApduOperations::version(&mut session).await.unwrap(), "U2F_V2");
    }
}
