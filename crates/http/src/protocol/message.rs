use bytes::{Buf, Bytes};

/// One step of a decoded body: a piece of data, or the end of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, Self::Chunk(_))
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        if let Self::Chunk(bytes) = self { Some(bytes) } else { None }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        if let Self::Chunk(bytes) = self { Some(bytes) } else { None }
    }
}

/// How the body after a head is delimited.
///
/// Requests are either `Length`, `Chunked` or `Empty`. Only responses may run until the peer
/// closes the connection, which also rules out keep-alive for them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    Length(u64),
    Chunked,
    UntilClose,
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked)
    }

    /// No body bytes follow the head.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty | Self::Length(0))
    }

    /// The end of the body can be found without the connection closing.
    #[inline]
    pub fn is_self_delimiting(&self) -> bool {
        !matches!(self, Self::UntilClose)
    }
}
