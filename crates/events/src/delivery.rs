/// One message handed out by a [`MessageSource`](crate::MessageSource).
///
/// Notes:
/// - `id` is broker-assigned and only meaningful to the source that issued it
///   (it is what gets acknowledged).
/// - `payload` is opaque here; the dispatcher decodes it.
/// - `delivery_count` starts at 1 and grows with every redelivery of an
///   unacknowledged message. It drives the dead-letter bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    id: String,
    payload: Vec<u8>,
    delivery_count: u32,
}

impl Delivery {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>, delivery_count: u32) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            delivery_count,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}
