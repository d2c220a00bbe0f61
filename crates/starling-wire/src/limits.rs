//! Protocol constants and size limits.

/// Protocol marker carried by every protocol frame.
pub const PROTOCOL_NAME: &str = "helios-starling";

/// Wire-format version stamped on outbound envelopes.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default per-message ceiling in bytes (UTF-8 length of the serialized
/// form). Configurable at the node level.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum length of a method or topic name.
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum byte length of an error `message` field.
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 1024;

/// Namespaces that user code may not register methods under.
pub const RESERVED_NAMESPACES: [&str; 4] = ["system", "internal", "stream", "helios"];
