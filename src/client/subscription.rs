use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::conductor::ClientConductor;
use crate::client::image::Image;
use crate::client::ClientStatus;
use crate::logbuffer::header::Header;
use crate::logbuffer::reader::ControlledAction;
use crate::{Error, Result};

/// Receives messages from every publisher on a channel and stream.
///
/// Images are iterated in the order they connected. The image list is
/// replaced copy-on-write by the conductor, so a poll works on a stable
/// snapshot and never waits on the conductor.
pub struct Subscription {
    conductor: Weak<Mutex<ClientConductor>>,
    status: Arc<ClientStatus>,
    registration_id: i64,
    stream_id: i32,
    channel: String,
    channel_status_indicator_id: i32,
    images: Mutex<Arc<Vec<Arc<Image>>>>,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        conductor: Weak<Mutex<ClientConductor>>,
        status: Arc<ClientStatus>,
        registration_id: i64,
        stream_id: i32,
        channel: String,
        channel_status_indicator_id: i32,
    ) -> Self {
        Self {
            conductor,
            status,
            registration_id,
            stream_id,
            channel,
            channel_status_indicator_id,
            images: Mutex::new(Arc::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn channel_status_indicator_id(&self) -> i32 {
        self.channel_status_indicator_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedResource("subscription"));
        }
        Ok(())
    }

    /// Polls each image in connection order until `fragment_limit`
    /// fragments have been consumed. Returns the fragment count.
    pub fn poll<F>(&self, mut handler: F, fragment_limit: usize) -> Result<usize>
    where
        F: FnMut(&[u8], &Header),
    {
        self.ensure_open()?;
        if !self.status.is_driver_active() {
            return Ok(0);
        }
        let images = self.images();
        let mut fragments_read = 0;
        for image in images.iter() {
            if fragments_read >= fragment_limit {
                break;
            }
            fragments_read += image.poll(&mut handler, fragment_limit - fragments_read);
        }
        Ok(fragments_read)
    }

    pub fn controlled_poll<F>(&self, mut handler: F, fragment_limit: usize) -> Result<usize>
    where
        F: FnMut(&[u8], &Header) -> ControlledAction,
    {
        self.ensure_open()?;
        if !self.status.is_driver_active() {
            return Ok(0);
        }
        let images = self.images();
        let mut fragments_read = 0;
        for image in images.iter() {
            if fragments_read >= fragment_limit {
                break;
            }
            fragments_read +=
                image.controlled_poll(&mut handler, fragment_limit - fragments_read);
        }
        Ok(fragments_read)
    }

    /// Snapshot of the connected images.
    pub fn images(&self) -> Arc<Vec<Arc<Image>>> {
        Arc::clone(&self.images.lock())
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().len()
    }

    pub fn image_by_session_id(&self, session_id: i32) -> Option<Arc<Image>> {
        self.images
            .lock()
            .iter()
            .find(|image| image.session_id() == session_id)
            .cloned()
    }

    /// True while at least one image is connected.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.images.lock().iter().any(|image| !image.is_closed())
    }

    pub(crate) fn add_image(&self, image: Arc<Image>) {
        let mut images = self.images.lock();
        let mut next = Vec::with_capacity(images.len() + 1);
        next.extend(images.iter().cloned());
        next.push(image);
        *images = Arc::new(next);
    }

    pub(crate) fn remove_image(&self, correlation_id: i64) -> Option<Arc<Image>> {
        let mut images = self.images.lock();
        let index = images
            .iter()
            .position(|image| image.correlation_id() == correlation_id)?;
        let mut next: Vec<Arc<Image>> = images.iter().cloned().collect();
        let removed = next.remove(index);
        *images = Arc::new(next);
        removed.close();
        Some(removed)
    }

    pub(crate) fn has_image(&self, correlation_id: i64) -> bool {
        self.images
            .lock()
            .iter()
            .any(|image| image.correlation_id() == correlation_id)
    }

    /// Closes every image and empties the list; returns the images removed.
    pub(crate) fn close_and_take_images(&self) -> Vec<Arc<Image>> {
        self.closed.store(true, Ordering::Release);
        let mut images = self.images.lock();
        let taken: Vec<Arc<Image>> = images.iter().cloned().collect();
        *images = Arc::new(Vec::new());
        for image in &taken {
            image.close();
        }
        taken
    }

    /// Idempotent. Images are released once the last snapshot holding them
    /// is dropped.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.conductor.upgrade() {
            Some(conductor) => conductor.lock().release_subscription(self.registration_id),
            None => {
                self.close_and_take_images();
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("registration_id", &self.registration_id)
            .field("stream_id", &self.stream_id)
            .field("channel", &self.channel)
            .field("image_count", &self.image_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
