use crate::Encoding;

/// The four call shapes. Each one fixes which directions carry a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl CallShape {
    #[must_use]
    pub fn streams_requests(self) -> bool {
        matches!(self, CallShape::ClientStreaming | CallShape::DuplexStreaming)
    }

    #[must_use]
    pub fn streams_responses(self) -> bool {
        matches!(self, CallShape::ServerStreaming | CallShape::DuplexStreaming)
    }
}

/// Method descriptor shared by the server method table and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub name: &'static str,
    pub shape: CallShape,
    pub encoding: Encoding,
}

impl Method {
    #[must_use]
    pub const fn new(name: &'static str, shape: CallShape, encoding: Encoding) -> Self {
        Self {
            name,
            shape,
            encoding,
        }
    }

    #[must_use]
    pub const fn unary(name: &'static str) -> Self {
        Self::new(name, CallShape::Unary, Encoding::MessagePack)
    }

    #[must_use]
    pub const fn client_streaming(name: &'static str) -> Self {
        Self::new(name, CallShape::ClientStreaming, Encoding::MessagePack)
    }

    #[must_use]
    pub const fn server_streaming(name: &'static str) -> Self {
        Self::new(name, CallShape::ServerStreaming, Encoding::MessagePack)
    }

    #[must_use]
    pub const fn duplex_streaming(name: &'static str) -> Self {
        Self::new(name, CallShape::DuplexStreaming, Encoding::MessagePack)
    }

    #[must_use]
    pub const fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}
