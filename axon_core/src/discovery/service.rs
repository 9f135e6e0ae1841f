//! Service identities: the `(service, instance, event)` triple.
//!
//! Identifiers are fixed-capacity NUL-padded byte strings so a descriptor is
//! plain-old-data and can live in port control blocks and discovery messages
//! without indirection. Wildcards (`*`) exist only in [`ServicePattern`]
//! queries — a wildcard is never a valid identity and the broker rejects
//! OFFER/SUB messages carrying one.

use std::fmt;

/// Capacity of one identifier, including nothing but payload bytes
/// (NUL-padded, truncating).
pub const SERVICE_STRING_CAPACITY: usize = 16;

/// The wildcard identifier, valid in queries only.
pub const WILDCARD: &str = "*";

/// Fixed-capacity identifier string (POD, 16 bytes).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceString([u8; SERVICE_STRING_CAPACITY]);

impl ServiceString {
    /// Build from a str, truncating to capacity.
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; SERVICE_STRING_CAPACITY];
        let bytes = s.as_bytes();
        let len = bytes.len().min(SERVICE_STRING_CAPACITY);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }

    /// The identifier as a str (up to the first NUL).
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    fn is_wildcard(&self) -> bool {
        self.as_str() == WILDCARD
    }
}

impl From<&str> for ServiceString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Debug for ServiceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ServiceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class-of-service tag carried alongside the triple. Matching ignores it;
/// gateways and tooling use it to segregate traffic classes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceClass {
    #[default]
    Data = 0,
    Control = 1,
}

impl ServiceClass {
    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => ServiceClass::Control,
            _ => ServiceClass::Data,
        }
    }
}

/// A service identity: `(service, instance, event)` plus the class tag.
///
/// Equality is componentwise. Discovery matching compares the triple only
/// (see [`ServiceDescriptor::same_topic`]).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    pub service: ServiceString,
    pub instance: ServiceString,
    pub event: ServiceString,
    class: u32,
}

impl ServiceDescriptor {
    pub fn new(service: &str, instance: &str, event: &str) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
            event: event.into(),
            class: ServiceClass::Data as u32,
        }
    }

    pub fn with_class(mut self, class: ServiceClass) -> Self {
        self.class = class as u32;
        self
    }

    pub fn class(&self) -> ServiceClass {
        ServiceClass::from_u32(self.class)
    }

    /// Whether two descriptors name the same topic (triple comparison; the
    /// class tag does not participate in matching).
    pub fn same_topic(&self, other: &ServiceDescriptor) -> bool {
        self.service == other.service
            && self.instance == other.instance
            && self.event == other.event
    }

    /// The triple as a hashable key for registry maps.
    pub fn key(&self) -> ServiceKey {
        ServiceKey(self.service, self.instance, self.event)
    }

    /// A wildcard anywhere makes the identity invalid for OFFER/SUB.
    pub fn has_wildcard(&self) -> bool {
        self.service.is_wildcard() || self.instance.is_wildcard() || self.event.is_wildcard()
    }

    /// An identity must name all three components.
    pub fn is_complete(&self) -> bool {
        !self.service.is_empty() && !self.instance.is_empty() && !self.event.is_empty()
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.service.as_str(),
            self.instance.as_str(),
            self.event.as_str()
        )
    }
}

/// Hashable topic key: the identity triple without the class tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ServiceKey(ServiceString, ServiceString, ServiceString);

/// Wildcard query over service identities. `None` components match anything.
/// Patterns are valid in registry queries only — never on the wire.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServicePattern {
    pub service: Option<ServiceString>,
    pub instance: Option<ServiceString>,
    pub event: Option<ServiceString>,
}

impl ServicePattern {
    /// Parse a component: `*` (or empty) is a wildcard.
    fn component(s: &str) -> Option<ServiceString> {
        if s == WILDCARD || s.is_empty() {
            None
        } else {
            Some(s.into())
        }
    }

    pub fn new(service: &str, instance: &str, event: &str) -> Self {
        Self {
            service: Self::component(service),
            instance: Self::component(instance),
            event: Self::component(event),
        }
    }

    pub fn matches(&self, desc: &ServiceDescriptor) -> bool {
        self.service.map_or(true, |s| s == desc.service)
            && self.instance.map_or(true, |i| i == desc.instance)
            && self.event.map_or(true, |e| e == desc.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_truncates_and_roundtrips() {
        let s = ServiceString::new("radar_front");
        assert_eq!(s.as_str(), "radar_front");

        let long = ServiceString::new("a_very_long_identifier_name");
        assert_eq!(long.as_str().len(), SERVICE_STRING_CAPACITY);
    }

    #[test]
    fn equality_is_componentwise() {
        let a = ServiceDescriptor::new("radar", "front", "objects");
        let b = ServiceDescriptor::new("radar", "front", "objects");
        let c = ServiceDescriptor::new("radar", "rear", "objects");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.same_topic(&b));
        assert!(!a.same_topic(&c));
    }

    #[test]
    fn class_does_not_affect_matching() {
        let a = ServiceDescriptor::new("radar", "front", "objects");
        let b = a.with_class(ServiceClass::Control);
        assert!(a.same_topic(&b));
        assert_ne!(a, b, "full equality still sees the class");
    }

    #[test]
    fn wildcard_queries_only() {
        let desc = ServiceDescriptor::new("radar", "front", "objects");
        assert!(ServicePattern::new("radar", "*", "*").matches(&desc));
        assert!(ServicePattern::new("*", "*", "*").matches(&desc));
        assert!(!ServicePattern::new("lidar", "*", "*").matches(&desc));

        // A wildcard is never a valid identity; the registry rejects it.
        let wild = ServiceDescriptor::new("*", "front", "objects");
        assert!(wild.has_wildcard());
        assert!(!desc.same_topic(&wild));
    }
}
