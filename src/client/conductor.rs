//! The client conductor turns application requests into driver commands and
//! driver responses into publications, subscriptions, images and counters.
//!
//! Every request is keyed by the correlation id it was sent with. The
//! application thread records a pending registration; the duty cycle
//! resolves it when the matching response arrives on the broadcast buffer;
//! `find_*` reports whichever state the registration is in.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::counter::Counter;
use crate::client::driver_proxy::DriverProxy;
use crate::client::image::Image;
use crate::client::publication::Publication;
use crate::client::subscription::Subscription;
use crate::client::ClientStatus;
use crate::clock::Clock;
use crate::cnc::CncFile;
use crate::concurrent::agent::Agent;
use crate::concurrent::broadcast::CopyBroadcastReceiver;
use crate::concurrent::counters::{
    CounterHandle, CountersReader, CLIENT_HEARTBEAT_TYPE_ID, DRIVER_HEARTBEAT_TYPE_ID,
};
use crate::context::ImageHandler;
use crate::error::{ErrorCode, ErrorHandler};
use crate::logbuffer::log_buffers::LogBuffers;
use crate::protocol::{
    ClientTimeout, CounterUpdate, ErrorResponse, ImageMessage, ImageReady, Message,
    OperationSucceeded, PublicationReady, ResponseTypeId, SubscriptionReady,
};
use crate::{Error, Result};

const MAX_RESPONSES_PER_CYCLE: usize = 64;

#[derive(Debug)]
pub enum RegistrationState<T> {
    AwaitingMediaDriver,
    Registered(Arc<T>),
    Errored { code: ErrorCode, message: String },
}

#[derive(Debug)]
struct Registration<T> {
    channel: String,
    stream_id: i32,
    registered_at_ms: i64,
    state: RegistrationState<T>,
}

impl<T> Registration<T> {
    fn pending(channel: &str, stream_id: i32, now_ms: i64) -> Self {
        Self {
            channel: channel.to_string(),
            stream_id,
            registered_at_ms: now_ms,
            state: RegistrationState::AwaitingMediaDriver,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, RegistrationState::AwaitingMediaDriver)
    }

    fn registered(&self) -> Option<&Arc<T>> {
        match &self.state {
            RegistrationState::Registered(handle) => Some(handle),
            _ => None,
        }
    }
}

pub(crate) struct ConductorConfig {
    pub driver_timeout_ms: i64,
    pub keepalive_interval_ms: i64,
    pub clock: Arc<dyn Clock>,
    pub error_handler: ErrorHandler,
    pub on_available_image: Option<ImageHandler>,
    pub on_unavailable_image: Option<ImageHandler>,
}

pub struct ClientConductor {
    config: ConductorConfig,
    self_ref: Weak<Mutex<ClientConductor>>,
    cnc: Arc<CncFile>,
    status: Arc<ClientStatus>,
    proxy: DriverProxy,
    receiver: CopyBroadcastReceiver,
    counters: CountersReader,
    publications: HashMap<i64, Registration<Publication>>,
    subscriptions: HashMap<i64, Registration<Subscription>>,
    user_counters: HashMap<i64, Registration<Counter>>,
    log_buffers: HashMap<String, Weak<LogBuffers>>,
    driver_heartbeat: Option<CounterHandle>,
    client_heartbeat: Option<CounterHandle>,
    time_of_last_keepalive_ms: Option<i64>,
}

fn errored<T>(msg: &ErrorResponse) -> RegistrationState<T> {
    RegistrationState::Errored {
        code: msg.code,
        message: msg.message.clone(),
    }
}

/// Resolves one registration table entry for `find_*`. Once the driver is
/// inactive every known id reports `DriverTimeout` and stays in the table.
fn resolve<T>(
    table: &mut HashMap<i64, Registration<T>>,
    correlation_id: i64,
    now_ms: i64,
    driver_timeout_ms: i64,
    driver_active: bool,
) -> Result<Option<Arc<T>>> {
    let Some(registration) = table.get(&correlation_id) else {
        return Err(Error::UnknownRegistration(correlation_id));
    };
    if !driver_active {
        return Err(Error::DriverTimeout(format!(
            "driver inactive, registration {correlation_id} unavailable"
        )));
    }
    match &registration.state {
        RegistrationState::Registered(handle) => Ok(Some(Arc::clone(handle))),
        RegistrationState::Errored { .. } => {
            let Some(Registration {
                state: RegistrationState::Errored { code, message },
                ..
            }) = table.remove(&correlation_id)
            else {
                return Err(Error::UnknownRegistration(correlation_id));
            };
            Err(Error::Registration {
                correlation_id,
                code,
                message,
            })
        }
        RegistrationState::AwaitingMediaDriver => {
            if now_ms - registration.registered_at_ms > driver_timeout_ms {
                let channel = registration.channel.clone();
                let stream_id = registration.stream_id;
                table.remove(&correlation_id);
                return Err(Error::DriverTimeout(format!(
                    "no response to registration {correlation_id} ({channel} stream {stream_id}) within {driver_timeout_ms}ms"
                )));
            }
            Ok(None)
        }
    }
}

impl ClientConductor {
    pub(crate) fn new(
        config: ConductorConfig,
        self_ref: Weak<Mutex<ClientConductor>>,
        cnc: Arc<CncFile>,
        status: Arc<ClientStatus>,
        proxy: DriverProxy,
        receiver: CopyBroadcastReceiver,
    ) -> Self {
        let counters = cnc.counters_reader();
        Self {
            config,
            self_ref,
            cnc,
            status,
            proxy,
            receiver,
            counters,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
            user_counters: HashMap::new(),
            log_buffers: HashMap::new(),
            driver_heartbeat: None,
            client_heartbeat: None,
            time_of_last_keepalive_ms: None,
        }
    }

    pub fn client_id(&self) -> i64 {
        self.proxy.client_id()
    }

    fn now_ms(&self) -> i64 {
        self.config.clock.now_ms()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_closed() {
            if self.status.is_timed_out() {
                return Err(Error::ClientTimeout);
            }
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.status.is_driver_active() {
            return Err(Error::DriverTimeout("driver is inactive".into()));
        }
        Ok(())
    }

    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.ensure_usable()?;
        let correlation_id = self.proxy.add_publication(channel, stream_id)?;
        log::debug!("add publication {correlation_id}: {channel} stream {stream_id}");
        self.publications.insert(
            correlation_id,
            Registration::pending(channel, stream_id, self.now_ms()),
        );
        Ok(correlation_id)
    }

    pub fn add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.ensure_usable()?;
        let correlation_id = self.proxy.add_subscription(channel, stream_id)?;
        log::debug!("add subscription {correlation_id}: {channel} stream {stream_id}");
        self.subscriptions.insert(
            correlation_id,
            Registration::pending(channel, stream_id, self.now_ms()),
        );
        Ok(correlation_id)
    }

    pub fn add_counter(&mut self, type_id: i32, key: &[u8], label: &str) -> Result<i64> {
        self.ensure_usable()?;
        let correlation_id = self.proxy.add_counter(type_id, key, label)?;
        log::debug!("add counter {correlation_id}: type {type_id} '{label}'");
        self.user_counters.insert(
            correlation_id,
            Registration::pending(label, type_id, self.now_ms()),
        );
        Ok(correlation_id)
    }

    pub fn find_publication(&mut self, correlation_id: i64) -> Result<Option<Arc<Publication>>> {
        self.ensure_open()?;
        let now_ms = self.now_ms();
        resolve(
            &mut self.publications,
            correlation_id,
            now_ms,
            self.config.driver_timeout_ms,
            self.status.is_driver_active(),
        )
    }

    pub fn find_subscription(&mut self, correlation_id: i64) -> Result<Option<Arc<Subscription>>> {
        self.ensure_open()?;
        let now_ms = self.now_ms();
        resolve(
            &mut self.subscriptions,
            correlation_id,
            now_ms,
            self.config.driver_timeout_ms,
            self.status.is_driver_active(),
        )
    }

    pub fn find_counter(&mut self, correlation_id: i64) -> Result<Option<Arc<Counter>>> {
        self.ensure_open()?;
        let now_ms = self.now_ms();
        resolve(
            &mut self.user_counters,
            correlation_id,
            now_ms,
            self.config.driver_timeout_ms,
            self.status.is_driver_active(),
        )
    }

    fn driver_can_be_told(&self) -> bool {
        !self.status.is_closed() && self.status.is_driver_active()
    }

    pub(crate) fn release_publication(&mut self, correlation_id: i64) -> Result<()> {
        let Some(registration) = self.publications.remove(&correlation_id) else {
            return Ok(());
        };
        if let Some(publication) = registration.registered() {
            publication.mark_closed();
        }
        if self.driver_can_be_told() {
            self.proxy.remove_publication(correlation_id)?;
        }
        log::debug!("released publication {correlation_id}");
        Ok(())
    }

    pub(crate) fn release_subscription(&mut self, correlation_id: i64) -> Result<()> {
        let Some(registration) = self.subscriptions.remove(&correlation_id) else {
            return Ok(());
        };
        if let Some(subscription) = registration.registered() {
            for image in subscription.close_and_take_images() {
                self.notify_unavailable(&image);
            }
        }
        if self.driver_can_be_told() {
            self.proxy.remove_subscription(correlation_id)?;
        }
        log::debug!("released subscription {correlation_id}");
        Ok(())
    }

    pub(crate) fn release_counter(&mut self, correlation_id: i64) -> Result<()> {
        let Some(registration) = self.user_counters.remove(&correlation_id) else {
            return Ok(());
        };
        if let Some(counter) = registration.registered() {
            counter.mark_closed();
        }
        if self.driver_can_be_told() {
            self.proxy.remove_counter(correlation_id)?;
        }
        Ok(())
    }

    /// Closes every handle and tells the driver the client is leaving.
    pub(crate) fn close_client(&mut self) {
        if self.status.is_closed() {
            return;
        }
        if self.status.is_driver_active() {
            if let Err(err) = self.proxy.send_client_close() {
                (self.config.error_handler)(&err);
            }
        }
        self.close_all_handles();
        log::info!("client {} closed", self.client_id());
    }

    fn close_all_handles(&mut self) {
        self.status.set_closed();
        for (_, registration) in self.publications.drain() {
            if let Some(publication) = registration.registered() {
                publication.mark_closed();
            }
        }
        let subscriptions: Vec<_> = self.subscriptions.drain().collect();
        for (_, registration) in subscriptions {
            if let Some(subscription) = registration.registered() {
                for image in subscription.close_and_take_images() {
                    self.notify_unavailable(&image);
                }
            }
        }
        for (_, registration) in self.user_counters.drain() {
            if let Some(counter) = registration.registered() {
                counter.mark_closed();
            }
        }
        self.log_buffers.clear();
    }

    /// One conductor duty cycle.
    pub fn do_work(&mut self) -> Result<usize> {
        if self.status.is_closed() || !self.status.is_driver_active() {
            return Ok(0);
        }
        let now_ms = self.now_ms();
        self.check_driver_heartbeat(now_ms)?;
        let mut work_count = self.send_keepalive(now_ms)?;
        work_count += self.drain_responses()?;
        Ok(work_count)
    }

    fn check_driver_heartbeat(&mut self, now_ms: i64) -> Result<()> {
        if self.driver_heartbeat.is_none() {
            self.driver_heartbeat = self
                .counters
                .find_by_type_id_and_key(DRIVER_HEARTBEAT_TYPE_ID, &[])
                .and_then(|id| self.counters.handle(id));
        }
        let heartbeat = self
            .driver_heartbeat
            .and_then(|handle| self.counters.value_of(&handle));
        match heartbeat {
            Some(heartbeat_ms) if now_ms - heartbeat_ms <= self.config.driver_timeout_ms => Ok(()),
            _ => {
                self.status.set_driver_inactive();
                let age = heartbeat
                    .map(|ms| format!("{}ms old", now_ms - ms))
                    .unwrap_or_else(|| "missing".to_string());
                let message = format!(
                    "driver heartbeat {age}, timeout {}ms",
                    self.config.driver_timeout_ms
                );
                log::error!("{message}");
                Err(Error::DriverTimeout(message))
            }
        }
    }

    fn send_keepalive(&mut self, now_ms: i64) -> Result<usize> {
        if let Some(last) = self.time_of_last_keepalive_ms {
            if now_ms - last < self.config.keepalive_interval_ms {
                return Ok(0);
            }
        }
        self.time_of_last_keepalive_ms = Some(now_ms);

        if self.client_heartbeat.is_none() {
            let key = self.client_id().to_le_bytes();
            self.client_heartbeat = self
                .counters
                .find_by_type_id_and_key(CLIENT_HEARTBEAT_TYPE_ID, &key)
                .and_then(|id| self.counters.handle(id));
        }
        match self.client_heartbeat {
            Some(handle) if self.counters.value_of(&handle).is_some() => {
                self.counters.counter(handle.id).set(now_ms);
            }
            _ => {
                self.client_heartbeat = None;
                self.proxy.send_keepalive()?;
            }
        }
        Ok(1)
    }

    fn drain_responses(&mut self) -> Result<usize> {
        let mut responses: Vec<(i32, Vec<u8>)> = Vec::new();
        while responses.len() < MAX_RESPONSES_PER_CYCLE {
            match self
                .receiver
                .receive(|msg_type_id, payload| responses.push((msg_type_id, payload.to_vec())))
            {
                Ok(0) => break,
                Ok(_) => {}
                Err(Error::ListenerLapped) => (self.config.error_handler)(&Error::ListenerLapped),
                Err(err) => return Err(err),
            }
        }

        let work_count = responses.len();
        for (msg_type_id, payload) in responses {
            match self.on_response(msg_type_id, &payload) {
                Ok(()) => {}
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => (self.config.error_handler)(&err),
            }
        }
        Ok(work_count)
    }

    fn on_response(&mut self, msg_type_id: i32, payload: &[u8]) -> Result<()> {
        match ResponseTypeId::from_i32(msg_type_id) {
            Some(ResponseTypeId::OnPublicationReady) => {
                self.on_publication_ready(PublicationReady::decode(payload)?)
            }
            Some(ResponseTypeId::OnSubscriptionReady) => {
                self.on_subscription_ready(SubscriptionReady::decode(payload)?);
                Ok(())
            }
            Some(ResponseTypeId::OnAvailableImage) => {
                self.on_available_image(ImageReady::decode(payload)?)
            }
            Some(ResponseTypeId::OnUnavailableImage) => {
                self.on_unavailable_image(ImageMessage::decode(payload)?);
                Ok(())
            }
            Some(ResponseTypeId::OnError) => {
                self.on_error(ErrorResponse::decode(payload)?);
                Ok(())
            }
            Some(ResponseTypeId::OnCounterReady) => {
                self.on_counter_ready(CounterUpdate::decode(payload)?);
                Ok(())
            }
            Some(ResponseTypeId::OnOperationSuccess) => {
                let msg = OperationSucceeded::decode(payload)?;
                log::debug!("operation {} succeeded", msg.correlation_id);
                Ok(())
            }
            Some(ResponseTypeId::OnClientTimeout) => {
                self.on_client_timeout(ClientTimeout::decode(payload)?)
            }
            None => {
                log::debug!("ignoring response type {msg_type_id:#x}");
                Ok(())
            }
        }
    }

    fn map_log(&mut self, log_file: &str) -> Result<Arc<LogBuffers>> {
        if let Some(log) = self.log_buffers.get(log_file).and_then(Weak::upgrade) {
            return Ok(log);
        }
        let log = Arc::new(LogBuffers::open(Path::new(log_file))?);
        self.log_buffers
            .retain(|_, cached| cached.strong_count() > 0);
        self.log_buffers
            .insert(log_file.to_string(), Arc::downgrade(&log));
        Ok(log)
    }

    fn on_publication_ready(&mut self, msg: PublicationReady) -> Result<()> {
        let Some((channel, stream_id)) = self
            .publications
            .get(&msg.correlation_id)
            .filter(|registration| registration.is_pending())
            .map(|registration| (registration.channel.clone(), registration.stream_id))
        else {
            return Ok(());
        };

        let state = match self.map_log(&msg.log_file) {
            Ok(log) => RegistrationState::Registered(Arc::new(Publication::new(
                self.self_ref.clone(),
                Arc::clone(&self.status),
                log,
                Arc::clone(&self.cnc),
                self.counters.counter(msg.publication_limit_counter_id),
                msg.correlation_id,
                msg.registration_id,
                msg.session_id,
                stream_id,
                channel,
            ))),
            Err(err) => RegistrationState::Errored {
                code: ErrorCode::GenericError,
                message: format!("failed to map {}: {err}", msg.log_file),
            },
        };
        if let Some(registration) = self.publications.get_mut(&msg.correlation_id) {
            registration.state = state;
        }
        log::debug!(
            "publication {} ready: session {} log {}",
            msg.correlation_id,
            msg.session_id,
            msg.log_file
        );
        Ok(())
    }

    fn on_subscription_ready(&mut self, msg: SubscriptionReady) {
        let self_ref = self.self_ref.clone();
        let status = Arc::clone(&self.status);
        let Some(registration) = self
            .subscriptions
            .get_mut(&msg.correlation_id)
            .filter(|registration| registration.is_pending())
        else {
            return;
        };
        let subscription = Subscription::new(
            self_ref,
            status,
            msg.correlation_id,
            registration.stream_id,
            registration.channel.clone(),
            msg.channel_status_indicator_id,
        );
        registration.state = RegistrationState::Registered(Arc::new(subscription));
        log::debug!("subscription {} ready", msg.correlation_id);
    }

    fn on_available_image(&mut self, msg: ImageReady) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .get(&msg.subscription_registration_id)
            .and_then(|registration| registration.registered())
            .cloned()
        else {
            return Ok(());
        };
        if subscription.has_image(msg.correlation_id) {
            return Ok(());
        }
        let log = self.map_log(&msg.log_file)?;
        let image = Arc::new(Image::new(
            log,
            Arc::clone(&self.cnc),
            self.counters.counter(msg.subscriber_position_id),
            msg.correlation_id,
            msg.session_id,
            msg.stream_id,
            msg.subscription_registration_id,
            msg.source_identity,
        ));
        subscription.add_image(Arc::clone(&image));
        log::debug!(
            "image {} session {} available on subscription {}",
            msg.correlation_id,
            msg.session_id,
            msg.subscription_registration_id
        );
        if let Some(handler) = &self.config.on_available_image {
            handler(&image);
        }
        Ok(())
    }

    fn on_unavailable_image(&mut self, msg: ImageMessage) {
        let Some(subscription) = self
            .subscriptions
            .get(&msg.subscription_registration_id)
            .and_then(|registration| registration.registered())
            .cloned()
        else {
            return;
        };
        if let Some(image) = subscription.remove_image(msg.correlation_id) {
            log::debug!(
                "image {} unavailable on subscription {}",
                msg.correlation_id,
                msg.subscription_registration_id
            );
            self.notify_unavailable(&image);
        }
    }

    fn notify_unavailable(&self, image: &Image) {
        if let Some(handler) = &self.config.on_unavailable_image {
            handler(image);
        }
    }

    fn on_error(&mut self, msg: ErrorResponse) {
        let id = msg.offending_correlation_id;
        if let Some(registration) = self.publications.get_mut(&id).filter(|r| r.is_pending()) {
            registration.state = errored(&msg);
        } else if let Some(registration) =
            self.subscriptions.get_mut(&id).filter(|r| r.is_pending())
        {
            registration.state = errored(&msg);
        } else if let Some(registration) =
            self.user_counters.get_mut(&id).filter(|r| r.is_pending())
        {
            registration.state = errored(&msg);
        } else {
            return;
        }
        log::warn!("registration {id} rejected ({}): {}", msg.code, msg.message);
    }

    fn on_counter_ready(&mut self, msg: CounterUpdate) {
        let self_ref = self.self_ref.clone();
        let cnc = Arc::clone(&self.cnc);
        let atomic = self.counters.counter(msg.counter_id);
        let Some(registration) = self
            .user_counters
            .get_mut(&msg.correlation_id)
            .filter(|registration| registration.is_pending())
        else {
            return;
        };
        registration.state = RegistrationState::Registered(Arc::new(Counter::new(
            self_ref,
            cnc,
            atomic,
            msg.correlation_id,
        )));
    }

    fn on_client_timeout(&mut self, msg: ClientTimeout) -> Result<()> {
        if msg.client_id != self.client_id() {
            return Ok(());
        }
        log::error!("client {} timed out by driver", msg.client_id);
        self.status.set_timed_out();
        self.close_all_handles();
        Err(Error::ClientTimeout)
    }
}

/// Runs the conductor duty cycle from an agent runner or invoker.
pub struct ConductorAgent {
    conductor: Arc<Mutex<ClientConductor>>,
}

impl ConductorAgent {
    pub(crate) fn new(conductor: Arc<Mutex<ClientConductor>>) -> Self {
        Self { conductor }
    }
}

impl Agent for ConductorAgent {
    fn do_work(&mut self) -> Result<usize> {
        self.conductor.lock().do_work()
    }

    fn role_name(&self) -> &str {
        "conduit-client-conductor"
    }
}
