use super::message::{Message, MessageId, Payload, ResponseKind};

/// A reply received for a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request: MessageId,
    pub kind: ResponseKind,
    pub message: Message,
}

impl Response {
    /// Wrap `message` if it is a reply.
    pub fn from_message(message: Message) -> Option<Self> {
        let correlation = message.correlation?;
        Some(Self {
            request: correlation.id,
            kind: correlation.kind,
            message,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn payload<P: Payload>(&self) -> Option<&P> {
        self.message.payload()
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{Exit, Ping, Pong};
    use super::*;

    #[test]
    fn only_replies_become_responses() {
        assert!(Response::from_message(Message::new(MessageId(1), Ping)).is_none());

        let response = Response::from_message(Message::reply(
            MessageId(2),
            MessageId(1),
            ResponseKind::Partial,
            Pong,
        ))
        .unwrap();
        assert_eq!(response.request, MessageId(1));
        assert_eq!(response.kind, ResponseKind::Partial);
        assert!(!response.is_terminal());
        assert!(response.payload::<Pong>().is_some());
        assert!(response.payload::<Exit>().is_none());
    }
}
