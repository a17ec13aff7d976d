use bytes::Bytes;

/// Transport-neutral frame.
///
/// Transports convert their native representation into/from `TransportFrame`. The SSE
/// adapter only ever yields `Text`; control frames only appear on websocket transports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl TransportFrame {
    #[inline]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Bytes::from(text.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Payload bytes carrying application data, if any.
    ///
    /// Control frames (ping/pong/close) return `None`: they never reach the codec.
    #[inline]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            TransportFrame::Text(bytes) | TransportFrame::Binary(bytes) => Some(bytes.as_ref()),
            TransportFrame::Ping(_) | TransportFrame::Pong(_) | TransportFrame::Close(_) => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            TransportFrame::Text(bytes)
            | TransportFrame::Binary(bytes)
            | TransportFrame::Ping(bytes)
            | TransportFrame::Pong(bytes) => bytes.len(),
            TransportFrame::Close(_) => 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_carry_no_application_data() {
        assert_eq!(TransportFrame::text("{}").data(), Some(&b"{}"[..]));
        assert_eq!(TransportFrame::Ping(Bytes::from_static(b"x")).data(), None);
        assert_eq!(TransportFrame::close(1000, "bye").data(), None);
        assert!(TransportFrame::close(1000, "bye").is_empty());
    }
}
