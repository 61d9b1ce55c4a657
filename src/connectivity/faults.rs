//! UPnP IGD fault codes and per-operation recovery policies
//!
//! Router firmwares disagree on which fault they raise for the same
//! condition. The tables in this module describe, per operation, what the
//! client does with each fault, so a new vendor quirk is one more table row.

use super::mapping::{Mapping, MappingKind};

/// Fault codes raised by WANIPConnection / WANPPPConnection services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FaultCode {
    InvalidArguments = 402,
    ActionFailed = 501,
    Unauthorized = 606,
    SpecifiedArrayIndexInvalid = 713,
    NoSuchEntryInArray = 714,
    WildCardNotPermittedInSrcIp = 715,
    WildCardNotPermittedInExtPort = 716,
    ConflictInMappingEntry = 718,
    SamePortValuesRequired = 724,
    OnlyPermanentLeasesSupported = 725,
    RemoteHostOnlySupportsWildcard = 726,
    ExternalPortOnlySupportsWildcard = 727,
    NoPortMapsAvailable = 728,
    ConflictWithOtherMechanisms = 729,
    WildCardNotPermittedInIntPort = 732,
}

impl FaultCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            402 => Some(Self::InvalidArguments),
            501 => Some(Self::ActionFailed),
            606 => Some(Self::Unauthorized),
            713 => Some(Self::SpecifiedArrayIndexInvalid),
            714 => Some(Self::NoSuchEntryInArray),
            715 => Some(Self::WildCardNotPermittedInSrcIp),
            716 => Some(Self::WildCardNotPermittedInExtPort),
            718 => Some(Self::ConflictInMappingEntry),
            724 => Some(Self::SamePortValuesRequired),
            725 => Some(Self::OnlyPermanentLeasesSupported),
            726 => Some(Self::RemoteHostOnlySupportsWildcard),
            727 => Some(Self::ExternalPortOnlySupportsWildcard),
            728 => Some(Self::NoPortMapsAvailable),
            729 => Some(Self::ConflictWithOtherMechanisms),
            732 => Some(Self::WildCardNotPermittedInIntPort),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn to_error_message(&self) -> &'static str {
        match self {
            Self::InvalidArguments => "Invalid arguments",
            Self::ActionFailed => "Action failed",
            Self::Unauthorized => "Action not authorized",
            Self::SpecifiedArrayIndexInvalid => "Specified array index invalid",
            Self::NoSuchEntryInArray => "No such entry in array",
            Self::WildCardNotPermittedInSrcIp => "Wildcard not permitted in source IP",
            Self::WildCardNotPermittedInExtPort => "Wildcard not permitted in external port",
            Self::ConflictInMappingEntry => "Conflict with an already existing mapping",
            Self::SamePortValuesRequired => "Internal and external port values must be the same",
            Self::OnlyPermanentLeasesSupported => "Only permanent leases supported",
            Self::RemoteHostOnlySupportsWildcard => "Remote host only supports wildcard",
            Self::ExternalPortOnlySupportsWildcard => "External port only supports wildcard",
            Self::NoPortMapsAvailable => "No port maps available",
            Self::ConflictWithOtherMechanisms => "Conflict with other mechanisms",
            Self::WildCardNotPermittedInIntPort => "Wildcard not permitted in internal port",
        }
    }
}

/// What to do with a fault raised by one operation
#[derive(Debug, Clone, Copy)]
pub enum FaultPolicy {
    /// Rewrite the request and try again
    RetryWithMutation(fn(&Mapping) -> Mapping),
    /// Propagate the fault to the caller
    Fatal,
    /// The device is already in the desired end state
    TreatAsSuccess,
    /// The entry does not exist (or the table has ended)
    TreatAsNotFound,
}

fn force_permanent_lease(mapping: &Mapping) -> Mapping {
    mapping.with_lease(0, MappingKind::ForcedSession)
}

fn mirror_private_port(mapping: &Mapping) -> Mapping {
    mapping.with_public_port(mapping.private_port())
}

fn wildcard_remote_host(mapping: &Mapping) -> Mapping {
    mapping.with_public_ip(None)
}

/// AddPortMapping recoveries; anything not listed is fatal
pub const CREATE_POLICIES: &[(FaultCode, FaultPolicy)] = &[
    (
        FaultCode::OnlyPermanentLeasesSupported,
        FaultPolicy::RetryWithMutation(force_permanent_lease),
    ),
    (
        FaultCode::SamePortValuesRequired,
        FaultPolicy::RetryWithMutation(mirror_private_port),
    ),
    (
        FaultCode::RemoteHostOnlySupportsWildcard,
        FaultPolicy::RetryWithMutation(wildcard_remote_host),
    ),
    (FaultCode::ExternalPortOnlySupportsWildcard, FaultPolicy::Fatal),
    (FaultCode::ConflictInMappingEntry, FaultPolicy::Fatal),
];

/// DeletePortMapping: a missing entry is the desired end state
pub const DELETE_POLICIES: &[(FaultCode, FaultPolicy)] =
    &[(FaultCode::NoSuchEntryInArray, FaultPolicy::TreatAsSuccess)];

/// GetGenericPortMappingEntry: vendors signal "no more entries" in several ways
pub const ENUMERATE_POLICIES: &[(FaultCode, FaultPolicy)] = &[
    (FaultCode::SpecifiedArrayIndexInvalid, FaultPolicy::TreatAsNotFound),
    (FaultCode::NoSuchEntryInArray, FaultPolicy::TreatAsNotFound),
    (FaultCode::InvalidArguments, FaultPolicy::TreatAsNotFound),
    (FaultCode::ActionFailed, FaultPolicy::TreatAsNotFound),
];

/// GetSpecificPortMappingEntry
pub const LOOKUP_POLICIES: &[(FaultCode, FaultPolicy)] = &[
    (FaultCode::NoSuchEntryInArray, FaultPolicy::TreatAsNotFound),
    (FaultCode::InvalidArguments, FaultPolicy::TreatAsNotFound),
];

/// Resolve the policy for a raw fault code in a table (unknown codes are fatal)
pub fn policy_for(table: &[(FaultCode, FaultPolicy)], code: u16) -> FaultPolicy {
    FaultCode::from_u16(code)
        .and_then(|kind| {
            table
                .iter()
                .find(|(candidate, _)| *candidate == kind)
                .map(|(_, policy)| *policy)
        })
        .unwrap_or(FaultPolicy::Fatal)
}
