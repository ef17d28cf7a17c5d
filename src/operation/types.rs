//! Operation type definitions.

/// Kind of operation tracked by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Write an entire buffer to a stream
    Write = 0,
    /// Read from a stream until a delimiter is buffered
    ReadUntil = 1,
    /// A completion queued without any I/O
    Post = 2,
}

impl OperationType {
    /// Returns true if this operation waits on socket readiness.
    #[inline]
    pub const fn requires_io(self) -> bool {
        match self {
            Self::Write | Self::ReadUntil => true,
            Self::Post => false,
        }
    }

    /// Returns true if this operation fills a buffer from the stream.
    #[inline]
    pub const fn is_read_like(self) -> bool {
        matches!(self, Self::ReadUntil)
    }

    /// Returns true if this operation drains a buffer into the stream.
    #[inline]
    pub const fn is_write_like(self) -> bool {
        matches!(self, Self::Write)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::ReadUntil => write!(f, "read_until"),
            Self::Post => write!(f, "post"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_properties() {
        assert!(OperationType::Write.requires_io());
        assert!(OperationType::ReadUntil.requires_io());
        assert!(!OperationType::Post.requires_io());

        assert!(OperationType::ReadUntil.is_read_like());
        assert!(!OperationType::Write.is_read_like());
        assert!(OperationType::Write.is_write_like());
        assert!(!OperationType::Post.is_write_like());
    }

    #[test]
    fn test_operation_type_display() {
        assert_eq!(OperationType::Write.to_string(), "write");
        assert_eq!(OperationType::ReadUntil.to_string(), "read_until");
        assert_eq!(OperationType::Post.to_string(), "post");
    }
}
