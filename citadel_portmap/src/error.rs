use std::fmt::Formatter;

/// Everything that can go wrong while discovering a gateway or negotiating a mapping.
///
/// None of these are fatal to the daemon. Callers treat every variant as "UPnP unavailable"
/// and fall through to the next NAT traversal strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMapError {
    /// The discovery window elapsed without a usable SSDP response
    DiscoveryTimeout,
    /// Socket or HTTP failure, including deadlines being exceeded
    Transport(String),
    /// Bad SSDP headers, device XML, or SOAP envelope
    MalformedResponse(String),
    /// The gateway exposes no WAN connection service we know how to drive
    UnsupportedDevice(String),
    /// The gateway answered with a SOAP fault
    ProtocolFault(SoapFault),
    /// A leased mapping expired before it could be renewed
    RenewalFailure(String),
    /// UPnP was switched off through the configuration knobs
    Disabled,
}

/// A decoded `s:Fault` body. `code` is absent when the gateway omits or garbles `errorCode`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SoapFault {
    pub code: Option<u32>,
    pub description: String,
    pub fault_string: String,
}

impl SoapFault {
    pub const INVALID_ARGS: u32 = 402;
    pub const ACTION_FAILED: u32 = 501;
    pub const ACTION_NOT_AUTHORIZED: u32 = 606;
    pub const NO_SUCH_ENTRY_IN_ARRAY: u32 = 714;
    pub const CONFLICT_IN_MAPPING_ENTRY: u32 = 718;
    pub const ONLY_PERMANENT_LEASES_SUPPORTED: u32 = 725;

    pub fn new<T: Into<String>>(code: u32, description: T) -> Self {
        Self {
            code: Some(code),
            description: description.into(),
            fault_string: "UPnPError".to_string(),
        }
    }

    /// The gateway refuses non-zero lease durations
    pub fn only_permanent_leases_supported(&self) -> bool {
        self.code == Some(Self::ONLY_PERMANENT_LEASES_SUPPORTED)
    }

    /// The mapping being deleted does not exist on the gateway
    pub fn no_such_entry(&self) -> bool {
        self.code == Some(Self::NO_SUCH_ENTRY_IN_ARRAY)
    }
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "UPnP error {code}: {}", self.description),
            None => write!(f, "SOAP fault: {}", self.fault_string),
        }
    }
}

impl PortMapError {
    pub fn std(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, self.to_string())
    }

    /// Whether the orchestration layer may retry after rebuilding the client
    pub fn is_transport(&self) -> bool {
        matches!(self, PortMapError::Transport(_))
    }

    pub fn fault(&self) -> Option<&SoapFault> {
        match self {
            PortMapError::ProtocolFault(fault) => Some(fault),
            _ => None,
        }
    }

    pub(crate) fn transport<T: std::fmt::Display>(err: T) -> Self {
        PortMapError::Transport(err.to_string())
    }

    pub(crate) fn malformed<T: std::fmt::Display>(err: T) -> Self {
        PortMapError::MalformedResponse(err.to_string())
    }
}

impl std::fmt::Display for PortMapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortMapError::DiscoveryTimeout => write!(f, "no UPnP gateway found"),
            PortMapError::Transport(err) => write!(f, "transport error: {err}"),
            PortMapError::MalformedResponse(err) => write!(f, "malformed response: {err}"),
            PortMapError::UnsupportedDevice(err) => write!(f, "unsupported device: {err}"),
            PortMapError::ProtocolFault(fault) => write!(f, "{fault}"),
            PortMapError::RenewalFailure(err) => write!(f, "renewal failure: {err}"),
            PortMapError::Disabled => write!(f, "UPnP disabled by configuration"),
        }
    }
}

impl std::error::Error for PortMapError {}

impl From<PortMapError> for std::io::Error {
    fn from(val: PortMapError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, val.to_string())
    }
}

impl From<std::io::Error> for PortMapError {
    fn from(err: std::io::Error) -> Self {
        PortMapError::Transport(err.to_string())
    }
}

impl From<SoapFault> for PortMapError {
    fn from(fault: SoapFault) -> Self {
        PortMapError::ProtocolFault(fault)
    }
}

impl From<reqwest::Error> for PortMapError {
    fn from(err: reqwest::Error) -> Self {
        PortMapError::Transport(err.to_string())
    }
}
