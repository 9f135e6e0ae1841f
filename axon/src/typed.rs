//! Typed zero-copy publishers and subscribers for POD payloads.
//!
//! The untyped ports move raw byte payloads; this layer fixes the payload
//! type to a `bytemuck::Pod` struct and wraps loans in RAII samples:
//! [`SampleMut`] releases an unpublished loan on drop, [`Sample`] releases
//! the received reference on drop. Payload access is a plain deref — the
//! bytes live in shared memory the whole time.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytemuck::Pod;

use axon_core::error::{AxonError, AxonResult, LoanError};
use axon_core::memory::{Chunk, SegmentMap};
use axon_core::port::{PublisherPort, SubscriberPort};
use axon_core::{
    PublisherOptions, Runtime, ServiceDescriptor, SubscriptionOptions, SubscriptionState, WaitSet,
};

/// Chunk payloads are 8-byte aligned; a Pod type with stricter alignment
/// cannot be mapped in place.
fn check_layout<T: Pod>() -> AxonResult<()> {
    if std::mem::align_of::<T>() > 8 {
        return Err(AxonError::config(format!(
            "payload type {} requires {}-byte alignment; chunks guarantee 8",
            std::any::type_name::<T>(),
            std::mem::align_of::<T>()
        )));
    }
    Ok(())
}

/// Typed publisher over an untyped port.
pub struct Publisher<T: Pod> {
    port: PublisherPort,
    _marker: PhantomData<T>,
}

impl<T: Pod> Publisher<T> {
    /// Claim a publisher port for `service` with default options.
    pub fn create(rt: &Runtime, service: ServiceDescriptor) -> AxonResult<Self> {
        Self::create_with(rt, service, PublisherOptions::default())
    }

    pub fn create_with(
        rt: &Runtime,
        service: ServiceDescriptor,
        opts: PublisherOptions,
    ) -> AxonResult<Self> {
        check_layout::<T>()?;
        Ok(Self {
            port: rt.create_publisher(service, opts)?,
            _marker: PhantomData,
        })
    }

    pub fn offer(&mut self) -> AxonResult<()> {
        self.port.offer()
    }

    pub fn stop_offer(&mut self) -> AxonResult<()> {
        self.port.stop_offer()
    }

    pub fn has_subscribers(&mut self) -> bool {
        self.port.has_subscribers()
    }

    /// Loan a zero-initialized sample. Write through it, then
    /// [`SampleMut::publish`]; dropping it unpublished returns the chunk.
    pub fn loan(&mut self) -> Result<SampleMut<'_, T>, LoanError> {
        let mut chunk = self.port.loan(std::mem::size_of::<T>() as u32)?;
        chunk.payload_mut().fill(0);
        Ok(SampleMut {
            chunk: Some(chunk),
            publisher: self,
        })
    }

    /// Copy `value` into a fresh loan and publish it.
    pub fn send(&mut self, value: T) -> Result<(), LoanError> {
        let mut sample = self.loan()?;
        *sample = value;
        sample.publish();
        Ok(())
    }

    /// The untyped port underneath (discovery state, ids).
    pub fn port(&self) -> &PublisherPort {
        &self.port
    }
}

/// A loaned, writable sample. Publishes by value; releases on drop if
/// never published.
pub struct SampleMut<'a, T: Pod> {
    chunk: Option<Chunk>,
    publisher: &'a mut Publisher<T>,
}

impl<T: Pod> SampleMut<'_, T> {
    /// Publish the sample to every wired subscriber.
    pub fn publish(mut self) {
        let chunk = self.chunk.take().expect("sample published twice");
        self.publisher.port.publish(chunk);
    }
}

impl<T: Pod> Deref for SampleMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        let chunk = self.chunk.as_ref().expect("live sample");
        bytemuck::from_bytes(&chunk.payload()[..std::mem::size_of::<T>()])
    }
}

impl<T: Pod> DerefMut for SampleMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        let chunk = self.chunk.as_mut().expect("live sample");
        bytemuck::from_bytes_mut(&mut chunk.payload_mut()[..std::mem::size_of::<T>()])
    }
}

impl<T: Pod> Drop for SampleMut<'_, T> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.publisher.port.release(chunk);
        }
    }
}

/// Typed subscriber over an untyped port.
pub struct Subscriber<T: Pod> {
    port: SubscriberPort,
    map: Arc<SegmentMap>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Subscriber<T> {
    pub fn create(rt: &Runtime, service: ServiceDescriptor) -> AxonResult<Self> {
        check_layout::<T>()?;
        Ok(Self {
            port: rt.create_subscriber(service)?,
            map: Arc::clone(rt.segment_map()),
            _marker: PhantomData,
        })
    }

    pub fn subscribe(&mut self, opts: SubscriptionOptions) -> AxonResult<()> {
        self.port.subscribe(opts)
    }

    pub fn unsubscribe(&mut self) -> AxonResult<()> {
        self.port.unsubscribe()
    }

    pub fn state(&mut self) -> SubscriptionState {
        self.port.state()
    }

    pub fn has_data(&self) -> bool {
        self.port.has_data()
    }

    pub fn overflow_count(&self) -> u64 {
        self.port.overflow_count()
    }

    /// Pop the next sample, if any. The payload size is validated against
    /// `T` — a mismatch means publisher and subscriber disagree on the
    /// type, and the sample is dropped with an error.
    pub fn take(&mut self) -> AxonResult<Option<Sample<T>>> {
        let Some(chunk) = self.port.try_get_chunk() else {
            return Ok(None);
        };
        if chunk.payload_size() < std::mem::size_of::<T>() {
            self.map.release_chunk(chunk);
            return Err(AxonError::config(format!(
                "received payload smaller than {}",
                std::any::type_name::<T>()
            )));
        }
        Ok(Some(Sample {
            chunk: Some(chunk),
            map: Arc::clone(&self.map),
            _marker: PhantomData,
        }))
    }

    /// Bind this subscriber to `waitset` trigger `index`.
    pub fn attach_to(&self, waitset: &mut WaitSet, index: u32) -> AxonResult<()> {
        waitset.attach_subscriber(&self.port, index)
    }

    /// The untyped port underneath.
    pub fn port(&self) -> &SubscriberPort {
        &self.port
    }
}

/// A received sample; releases its chunk reference on drop.
pub struct Sample<T: Pod> {
    chunk: Option<Chunk>,
    map: Arc<SegmentMap>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Sample<T> {
    /// Sequence number stamped by the publisher.
    pub fn sequence(&self) -> u64 {
        self.chunk.as_ref().expect("live sample").sequence()
    }

    /// Id of the publishing port.
    pub fn publisher_id(&self) -> u64 {
        self.chunk.as_ref().expect("live sample").publisher_id()
    }
}

impl<T: Pod> Deref for Sample<T> {
    type Target = T;

    fn deref(&self) -> &T {
        let chunk = self.chunk.as_ref().expect("live sample");
        bytemuck::from_bytes(&chunk.payload()[..std::mem::size_of::<T>()])
    }
}

impl<T: Pod> Drop for Sample<T> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.map.release_chunk(chunk);
        }
    }
}
