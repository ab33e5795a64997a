//! The driver duty cycle: consumes client commands, owns every counter and
//! IPC log, and answers on the broadcast buffer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::channel::ChannelUri;
use crate::clock::Clock;
use crate::cnc::CncFile;
use crate::concurrent::agent::Agent;
use crate::concurrent::broadcast::BroadcastTransmitter;
use crate::concurrent::counters::{
    is_system_type_id, AtomicCounter, CountersManager, CLIENT_HEARTBEAT_TYPE_ID,
    DRIVER_HEARTBEAT_TYPE_ID, PUBLISHER_LIMIT_TYPE_ID, PUBLISHER_POSITION_TYPE_ID,
    SUBSCRIBER_POSITION_TYPE_ID,
};
use crate::concurrent::ring_buffer::ManyToOneRingBuffer;
use crate::driver::ipc_publication::{IpcPublication, LogParams};
use crate::error::{ErrorCode, ErrorHandler};
use crate::protocol::{
    ChannelMessage, ClientTimeout, CommandTypeId, CorrelatedMessage, CounterMessage,
    CounterUpdate, ErrorResponse, ImageMessage, ImageReady, Message, OperationSucceeded,
    PublicationReady, RemoveMessage, ResponseTypeId, SubscriptionReady,
};
use crate::{Error, Result};

const COMMAND_LIMIT: usize = 64;
const IPC_SOURCE_IDENTITY: &str = "aeron:ipc";

#[derive(Debug, Clone)]
pub(crate) struct DriverConfig {
    pub publications_dir: PathBuf,
    pub term_length: usize,
    pub mtu: usize,
    pub term_window: usize,
    pub client_liveness_timeout_ms: i64,
    pub publication_linger_ms: i64,
    pub counter_free_to_reuse_ms: i64,
}

struct ClientSession {
    heartbeat: AtomicCounter,
    time_of_last_keepalive_ms: i64,
}

struct SubscriptionLink {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    channel: String,
}

struct CounterLink {
    registration_id: i64,
    client_id: i64,
    counter_id: i32,
}

pub struct DriverConductor {
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    error_handler: ErrorHandler,
    _cnc: Arc<CncFile>,
    to_driver: ManyToOneRingBuffer,
    to_clients: BroadcastTransmitter,
    counters: CountersManager,
    heartbeat: AtomicCounter,
    clients: HashMap<i64, ClientSession>,
    publications: Vec<IpcPublication>,
    subscriptions: Vec<SubscriptionLink>,
    counter_links: Vec<CounterLink>,
    next_session_id: i32,
}

impl DriverConductor {
    pub(crate) fn new(
        config: DriverConfig,
        cnc: Arc<CncFile>,
        clock: Arc<dyn Clock>,
        error_handler: ErrorHandler,
    ) -> Result<Self> {
        let to_driver = ManyToOneRingBuffer::new(cnc.to_driver_buffer())?;
        let to_clients = BroadcastTransmitter::new(cnc.to_clients_buffer())?;
        let mut counters = CountersManager::new(
            cnc.counters_metadata_buffer(),
            cnc.counters_values_buffer(),
            config.counter_free_to_reuse_ms,
        );
        let now_ms = clock.now_ms();
        let heartbeat_id = counters.allocate(
            DRIVER_HEARTBEAT_TYPE_ID,
            &[],
            "driver-heartbeat",
            to_driver.next_correlation_id(),
            0,
            now_ms,
        )?;
        let heartbeat = counters.counter(heartbeat_id);
        heartbeat.set(now_ms);
        let next_session_id = (clock.now() >> 10) as i32;

        Ok(Self {
            config,
            clock,
            error_handler,
            _cnc: cnc,
            to_driver,
            to_clients,
            counters,
            heartbeat,
            clients: HashMap::new(),
            publications: Vec::new(),
            subscriptions: Vec::new(),
            counter_links: Vec::new(),
            next_session_id,
        })
    }

    fn transmit<M: Message>(&self, type_id: ResponseTypeId, msg: &M) {
        if let Err(err) = self.to_clients.transmit(type_id.as_i32(), &msg.to_bytes()) {
            (self.error_handler)(&err);
        }
    }

    fn reject(&self, correlation_id: i64, code: ErrorCode, message: String) {
        log::warn!("rejecting command {correlation_id} ({code}): {message}");
        self.transmit(
            ResponseTypeId::OnError,
            &ErrorResponse {
                offending_correlation_id: correlation_id,
                code,
                message,
            },
        );
    }

    fn succeed(&self, correlation_id: i64) {
        self.transmit(
            ResponseTypeId::OnOperationSuccess,
            &OperationSucceeded { correlation_id },
        );
    }

    /// Registers the client on first contact and refreshes its keepalive.
    fn touch_client(&mut self, client_id: i64, now_ms: i64) -> Result<()> {
        if let Some(session) = self.clients.get_mut(&client_id) {
            session.time_of_last_keepalive_ms = now_ms;
            return Ok(());
        }
        let id = self.counters.allocate(
            CLIENT_HEARTBEAT_TYPE_ID,
            &client_id.to_le_bytes(),
            &format!("client-heartbeat: {client_id}"),
            client_id,
            client_id,
            now_ms,
        )?;
        let heartbeat = self.counters.counter(id);
        heartbeat.set(now_ms);
        self.clients.insert(
            client_id,
            ClientSession {
                heartbeat,
                time_of_last_keepalive_ms: now_ms,
            },
        );
        log::info!("client {client_id} connected");
        Ok(())
    }

    fn on_command(&mut self, msg_type_id: i32, payload: &[u8]) {
        let now_ms = self.clock.now_ms();
        let result = match CommandTypeId::from_i32(msg_type_id) {
            Some(CommandTypeId::AddPublication) => ChannelMessage::decode(payload)
                .and_then(|msg| self.on_add_publication(msg, now_ms)),
            Some(CommandTypeId::RemovePublication) => RemoveMessage::decode(payload)
                .and_then(|msg| self.on_remove_publication(msg, now_ms)),
            Some(CommandTypeId::AddSubscription) => ChannelMessage::decode(payload)
                .and_then(|msg| self.on_add_subscription(msg, now_ms)),
            Some(CommandTypeId::RemoveSubscription) => RemoveMessage::decode(payload)
                .and_then(|msg| self.on_remove_subscription(msg, now_ms)),
            Some(CommandTypeId::ClientKeepalive) => CorrelatedMessage::decode(payload)
                .and_then(|msg| self.touch_client(msg.client_id, now_ms)),
            Some(CommandTypeId::AddCounter) => CounterMessage::decode(payload)
                .and_then(|msg| self.on_add_counter(msg, now_ms)),
            Some(CommandTypeId::RemoveCounter) => RemoveMessage::decode(payload)
                .and_then(|msg| self.on_remove_counter(msg, now_ms)),
            Some(CommandTypeId::ClientClose) => CorrelatedMessage::decode(payload).map(|msg| {
                log::info!("client {} closed", msg.client_id);
                self.remove_client(msg.client_id, now_ms);
            }),
            None => {
                log::warn!("unknown command type {msg_type_id:#x}");
                Ok(())
            }
        };
        if let Err(err) = result {
            (self.error_handler)(&err);
        }
    }

    fn on_add_publication(&mut self, msg: ChannelMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        let channel = match ChannelUri::parse(&msg.channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.reject(msg.correlation_id, ErrorCode::InvalidChannel, err.to_string());
                return Ok(());
            }
        };
        if !channel.is_ipc() {
            self.reject(
                msg.correlation_id,
                ErrorCode::NotSupported,
                format!("media '{}' is not supported by this driver", channel.media().as_str()),
            );
            return Ok(());
        }
        let term_length = channel.term_length()?.unwrap_or(self.config.term_length);
        let mtu = channel.mtu()?.unwrap_or(self.config.mtu);

        let index = match self
            .publications
            .iter()
            .position(|p| p.is_active() && p.stream_id() == msg.stream_id)
        {
            Some(index) => {
                let existing = &self.publications[index];
                if existing.term_length() != term_length || existing.mtu() != mtu {
                    self.reject(
                        msg.correlation_id,
                        ErrorCode::InvalidChannel,
                        format!(
                            "stream {} already published with term-length {} mtu {}",
                            msg.stream_id,
                            existing.term_length(),
                            existing.mtu()
                        ),
                    );
                    return Ok(());
                }
                index
            }
            None => match self.create_publication(&msg, term_length, mtu, now_ms) {
                Ok(index) => index,
                Err(Error::CapacityExceeded(what)) => {
                    self.reject(
                        msg.correlation_id,
                        ErrorCode::ResourceExhausted,
                        format!("{what} exhausted"),
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
        };

        let publication = &mut self.publications[index];
        publication.add_publisher(msg.client_id, msg.correlation_id);
        let ready = PublicationReady {
            correlation_id: msg.correlation_id,
            registration_id: publication.registration_id(),
            session_id: publication.session_id(),
            stream_id: publication.stream_id(),
            publication_limit_counter_id: publication.publisher_limit_id(),
            log_file: publication.log_path().display().to_string(),
        };
        log::debug!(
            "publication {} ready on log {}",
            msg.correlation_id,
            ready.registration_id
        );
        self.transmit(ResponseTypeId::OnPublicationReady, &ready);
        Ok(())
    }

    fn create_publication(
        &mut self,
        msg: &ChannelMessage,
        term_length: usize,
        mtu: usize,
        now_ms: i64,
    ) -> Result<usize> {
        let registration_id = msg.correlation_id;
        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        let params = LogParams {
            registration_id,
            session_id,
            stream_id: msg.stream_id,
            initial_term_id: session_id.rotate_left(13) ^ msg.stream_id,
            term_length,
            mtu,
            term_window: self.config.term_window,
        };
        let key = publication_key(registration_id, session_id, msg.stream_id);

        let limit_id = self.counters.allocate(
            PUBLISHER_LIMIT_TYPE_ID,
            &key,
            &format!("pub-lmt: {registration_id} {session_id} {} {}", msg.stream_id, msg.channel),
            registration_id,
            msg.client_id,
            now_ms,
        )?;
        let position_id = match self.counters.allocate(
            PUBLISHER_POSITION_TYPE_ID,
            &key,
            &format!("pub-pos: {registration_id} {session_id} {} {}", msg.stream_id, msg.channel),
            registration_id,
            msg.client_id,
            now_ms,
        ) {
            Ok(id) => id,
            Err(err) => {
                self.counters.free(limit_id, now_ms);
                return Err(err);
            }
        };

        let path = self
            .config
            .publications_dir
            .join(format!("{registration_id}.logbuffer"));
        let publication = match IpcPublication::create(
            &path,
            &msg.channel,
            &params,
            self.counters.counter(limit_id),
            self.counters.counter(position_id),
        ) {
            Ok(publication) => publication,
            Err(err) => {
                self.counters.free(limit_id, now_ms);
                self.counters.free(position_id, now_ms);
                return Err(err);
            }
        };
        log::debug!(
            "created ipc log {registration_id}: session {session_id} stream {} term {term_length}",
            msg.stream_id
        );
        self.publications.push(publication);
        let index = self.publications.len() - 1;

        let joining: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|s| s.stream_id == msg.stream_id)
            .map(|s| s.registration_id)
            .collect();
        for subscription_id in joining {
            if let Err(err) = self.link_image(index, subscription_id, now_ms) {
                (self.error_handler)(&err);
            }
        }
        Ok(index)
    }

    /// Attaches a subscription to a log and announces the image.
    fn link_image(&mut self, index: usize, subscription_id: i64, now_ms: i64) -> Result<()> {
        let publication = &self.publications[index];
        let registration_id = publication.registration_id();
        let session_id = publication.session_id();
        let stream_id = publication.stream_id();
        let counter_id = self.counters.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &publication_key(registration_id, session_id, stream_id),
            &format!("sub-pos: {subscription_id} {session_id} {stream_id} {}", publication.channel()),
            subscription_id,
            registration_id,
            now_ms,
        )?;
        let position = self.counters.counter(counter_id);
        let publication = &mut self.publications[index];
        let join_position = publication.add_subscriber(subscription_id, position);
        let log_file = publication.log_path().display().to_string();
        log::debug!(
            "image {registration_id} joined subscription {subscription_id} at {join_position}"
        );
        self.transmit(
            ResponseTypeId::OnAvailableImage,
            &ImageReady {
                correlation_id: registration_id,
                session_id,
                stream_id,
                subscription_registration_id: subscription_id,
                subscriber_position_id: counter_id,
                log_file,
                source_identity: IPC_SOURCE_IDENTITY.to_string(),
            },
        );
        Ok(())
    }

    fn on_remove_publication(&mut self, msg: RemoveMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        let removed = self
            .publications
            .iter_mut()
            .filter(|p| p.has_publisher(msg.client_id, msg.registration_id))
            .any(|p| p.remove_publisher(msg.client_id, msg.registration_id, now_ms));
        if removed {
            self.succeed(msg.correlation_id);
        } else {
            self.reject(
                msg.correlation_id,
                ErrorCode::UnknownPublication,
                format!("unknown publication {}", msg.registration_id),
            );
        }
        Ok(())
    }

    fn on_add_subscription(&mut self, msg: ChannelMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        let channel = match ChannelUri::parse(&msg.channel) {
            Ok(channel) => channel,
            Err(err) => {
                self.reject(msg.correlation_id, ErrorCode::InvalidChannel, err.to_string());
                return Ok(());
            }
        };
        if !channel.is_ipc() {
            self.reject(
                msg.correlation_id,
                ErrorCode::NotSupported,
                format!("media '{}' is not supported by this driver", channel.media().as_str()),
            );
            return Ok(());
        }

        self.subscriptions.push(SubscriptionLink {
            registration_id: msg.correlation_id,
            client_id: msg.client_id,
            stream_id: msg.stream_id,
            channel: msg.channel.clone(),
        });
        self.transmit(
            ResponseTypeId::OnSubscriptionReady,
            &SubscriptionReady {
                correlation_id: msg.correlation_id,
                channel_status_indicator_id: -1,
            },
        );
        log::debug!(
            "subscription {} ready: {} stream {}",
            msg.correlation_id,
            msg.channel,
            msg.stream_id
        );

        let live: Vec<usize> = self
            .publications
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_active() && p.stream_id() == msg.stream_id)
            .map(|(index, _)| index)
            .collect();
        for index in live {
            if let Err(err) = self.link_image(index, msg.correlation_id, now_ms) {
                (self.error_handler)(&err);
            }
        }
        Ok(())
    }

    fn unlink_subscription(&mut self, registration_id: i64, now_ms: i64) {
        for publication in &mut self.publications {
            if let Some(subscriber) = publication.remove_subscriber(registration_id) {
                self.counters.free(subscriber.position.id(), now_ms);
            }
        }
    }

    fn on_remove_subscription(&mut self, msg: RemoveMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        let Some(index) = self.subscriptions.iter().position(|s| {
            s.registration_id == msg.registration_id && s.client_id == msg.client_id
        }) else {
            self.reject(
                msg.correlation_id,
                ErrorCode::UnknownSubscription,
                format!("unknown subscription {}", msg.registration_id),
            );
            return Ok(());
        };
        let link = self.subscriptions.remove(index);
        self.unlink_subscription(link.registration_id, now_ms);
        log::debug!("removed subscription {} on {}", link.registration_id, link.channel);
        self.succeed(msg.correlation_id);
        Ok(())
    }

    fn on_add_counter(&mut self, msg: CounterMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        if is_system_type_id(msg.type_id) {
            self.reject(
                msg.correlation_id,
                ErrorCode::GenericError,
                format!("counter type id {} is reserved", msg.type_id),
            );
            return Ok(());
        }
        let counter_id = match self.counters.allocate(
            msg.type_id,
            &msg.key,
            &msg.label,
            msg.correlation_id,
            msg.client_id,
            now_ms,
        ) {
            Ok(id) => id,
            Err(Error::CapacityExceeded(what)) => {
                self.reject(
                    msg.correlation_id,
                    ErrorCode::ResourceExhausted,
                    format!("{what} exhausted"),
                );
                return Ok(());
            }
            Err(Error::Administration(message)) => {
                self.reject(msg.correlation_id, ErrorCode::GenericError, message);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.counter_links.push(CounterLink {
            registration_id: msg.correlation_id,
            client_id: msg.client_id,
            counter_id,
        });
        self.transmit(
            ResponseTypeId::OnCounterReady,
            &CounterUpdate {
                correlation_id: msg.correlation_id,
                counter_id,
            },
        );
        Ok(())
    }

    fn on_remove_counter(&mut self, msg: RemoveMessage, now_ms: i64) -> Result<()> {
        self.touch_client(msg.client_id, now_ms)?;
        let Some(index) = self.counter_links.iter().position(|c| {
            c.registration_id == msg.registration_id && c.client_id == msg.client_id
        }) else {
            self.reject(
                msg.correlation_id,
                ErrorCode::UnknownCounter,
                format!("unknown counter {}", msg.registration_id),
            );
            return Ok(());
        };
        let link = self.counter_links.remove(index);
        self.counters.free(link.counter_id, now_ms);
        self.succeed(msg.correlation_id);
        Ok(())
    }

    /// Releases everything a client holds.
    fn remove_client(&mut self, client_id: i64, now_ms: i64) {
        for publication in &mut self.publications {
            publication.remove_client(client_id, now_ms);
        }
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|s| s.client_id == client_id);
        self.subscriptions = kept;
        for link in gone {
            self.unlink_subscription(link.registration_id, now_ms);
        }
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.counter_links)
            .into_iter()
            .partition(|c| c.client_id == client_id);
        self.counter_links = kept;
        for link in gone {
            self.counters.free(link.counter_id, now_ms);
        }
        if let Some(session) = self.clients.remove(&client_id) {
            self.counters.free(session.heartbeat.id(), now_ms);
        }
    }

    fn check_clients(&mut self, now_ms: i64) -> usize {
        let timeout_ms = self.config.client_liveness_timeout_ms;
        let expired: Vec<i64> = self
            .clients
            .iter()
            .filter(|(_, session)| {
                let last_seen = session
                    .heartbeat
                    .get()
                    .max(session.time_of_last_keepalive_ms);
                now_ms - last_seen > timeout_ms
            })
            .map(|(&client_id, _)| client_id)
            .collect();
        for &client_id in &expired {
            log::error!("client {client_id} timed out after {timeout_ms}ms");
            self.remove_client(client_id, now_ms);
            self.transmit(ResponseTypeId::OnClientTimeout, &ClientTimeout { client_id });
        }
        expired.len()
    }

    fn update_publications(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;
        for publication in &mut self.publications {
            work_count += publication.update_publisher_limit();
        }

        let linger_ms = self.config.publication_linger_ms;
        let mut index = 0;
        while index < self.publications.len() {
            if !self.publications[index].is_drained(now_ms, linger_ms) {
                index += 1;
                continue;
            }
            let publication = self.publications.swap_remove(index);
            self.retire(publication, now_ms);
            work_count += 1;
        }
        work_count
    }

    /// Announces the end of every image of a drained log, frees its counters
    /// and deletes the file.
    fn retire(&mut self, publication: IpcPublication, now_ms: i64) {
        let registration_id = publication.registration_id();
        for subscriber in publication.subscribers() {
            let channel = self
                .subscriptions
                .iter()
                .find(|s| s.registration_id == subscriber.subscription_registration_id)
                .map(|s| s.channel.clone())
                .unwrap_or_else(|| publication.channel().to_string());
            self.transmit(
                ResponseTypeId::OnUnavailableImage,
                &ImageMessage {
                    correlation_id: registration_id,
                    subscription_registration_id: subscriber.subscription_registration_id,
                    stream_id: publication.stream_id(),
                    channel,
                },
            );
            self.counters.free(subscriber.position.id(), now_ms);
        }
        self.counters.free(publication.publisher_limit_id(), now_ms);
        self.counters.free(publication.publisher_position_id(), now_ms);
        log::debug!("retired ipc log {registration_id}");
        if let Err(err) = publication.delete() {
            (self.error_handler)(&err);
        }
    }

    /// Deletes every remaining log. Used on shutdown.
    pub(crate) fn close_all(&mut self) {
        let now_ms = self.clock.now_ms();
        for publication in std::mem::take(&mut self.publications) {
            self.retire(publication, now_ms);
        }
    }

    pub fn do_work(&mut self) -> Result<usize> {
        let now_ms = self.clock.now_ms();
        self.heartbeat.set(now_ms);

        let ring = self.to_driver;
        let mut work_count = ring.read(
            |msg_type_id, payload| self.on_command(msg_type_id, payload),
            COMMAND_LIMIT,
        );
        work_count += self.check_clients(now_ms);
        work_count += self.update_publications(now_ms);
        Ok(work_count)
    }
}

fn publication_key(registration_id: i64, session_id: i32, stream_id: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&registration_id.to_le_bytes());
    key.extend_from_slice(&session_id.to_le_bytes());
    key.extend_from_slice(&stream_id.to_le_bytes());
    key
}

impl Agent for DriverConductor {
    fn do_work(&mut self) -> Result<usize> {
        DriverConductor::do_work(self)
    }

    fn on_close(&mut self) -> Result<()> {
        self.close_all();
        Ok(())
    }

    fn role_name(&self) -> &str {
        "conduit-driver-conductor"
    }
}
