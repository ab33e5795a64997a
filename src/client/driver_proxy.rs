use crate::channel::MAX_CHANNEL_LENGTH;
use crate::concurrent::ring_buffer::ManyToOneRingBuffer;
use crate::protocol::{
    ChannelMessage, CommandTypeId, CorrelatedMessage, CounterMessage, Message, RemoveMessage,
};
use crate::{Error, Result};

/// Encodes client commands onto the to-driver ring buffer.
#[derive(Clone, Copy, Debug)]
pub struct DriverProxy {
    to_driver: ManyToOneRingBuffer,
    client_id: i64,
}

impl DriverProxy {
    pub fn new(to_driver: ManyToOneRingBuffer, client_id: i64) -> Self {
        Self {
            to_driver,
            client_id,
        }
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.to_driver.next_correlation_id()
    }

    fn send(&self, command: CommandTypeId, message: &impl Message) -> Result<()> {
        let bytes = message.to_bytes();
        if !self.to_driver.write(command.as_i32(), &bytes)? {
            return Err(Error::Administration(format!(
                "could not write {command:?}: to-driver buffer full"
            )));
        }
        Ok(())
    }

    fn channel_command(&self, command: CommandTypeId, channel: &str, stream_id: i32) -> Result<i64> {
        if channel.is_empty() || channel.len() > MAX_CHANNEL_LENGTH {
            return Err(Error::Administration(format!(
                "channel length must be 1..={MAX_CHANNEL_LENGTH}: {}",
                channel.len()
            )));
        }
        let correlation_id = self.next_correlation_id();
        self.send(
            command,
            &ChannelMessage {
                client_id: self.client_id,
                correlation_id,
                stream_id,
                channel: channel.to_string(),
            },
        )?;
        Ok(correlation_id)
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.channel_command(CommandTypeId::AddPublication, channel, stream_id)
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.channel_command(CommandTypeId::AddSubscription, channel, stream_id)
    }

    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<i64> {
        let correlation_id = self.next_correlation_id();
        self.send(
            CommandTypeId::AddCounter,
            &CounterMessage {
                client_id: self.client_id,
                correlation_id,
                type_id,
                key: key.to_vec(),
                label: label.to_string(),
            },
        )?;
        Ok(correlation_id)
    }

    fn remove(&self, command: CommandTypeId, registration_id: i64) -> Result<i64> {
        let correlation_id = self.next_correlation_id();
        self.send(
            command,
            &RemoveMessage {
                client_id: self.client_id,
                correlation_id,
                registration_id,
            },
        )?;
        Ok(correlation_id)
    }

    pub fn remove_publication(&self, registration_id: i64) -> Result<i64> {
        self.remove(CommandTypeId::RemovePublication, registration_id)
    }

    pub fn remove_subscription(&self, registration_id: i64) -> Result<i64> {
        self.remove(CommandTypeId::RemoveSubscription, registration_id)
    }

    pub fn remove_counter(&self, registration_id: i64) -> Result<i64> {
        self.remove(CommandTypeId::RemoveCounter, registration_id)
    }

    pub fn send_keepalive(&self) -> Result<()> {
        self.send(
            CommandTypeId::ClientKeepalive,
            &CorrelatedMessage {
                client_id: self.client_id,
                correlation_id: 0,
            },
        )
    }

    pub fn send_client_close(&self) -> Result<()> {
        self.send(
            CommandTypeId::ClientClose,
            &CorrelatedMessage {
                client_id: self.client_id,
                correlation_id: self.next_correlation_id(),
            },
        )
    }
}
