//! Replicated operation payloads
//!
//! Every structural change is replicated as a [`MetadataOperationData`]
//! plus, for inserts, a [`RedoOperationData`]. Operations issued by state
//! providers are wrapped in a [`NamedOperationData`] so the replicator can
//! route them back to the owning provider on apply. All payloads are
//! bincode-encoded into [`OperationData`] buffers.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use txnrep_common::{Error, Result, StateProviderId};

/// Current payload format version
const OPERATION_DATA_VERSION: u32 = 1;

/// An ordered list of buffers handed to and from the logging replicator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationData {
    buffers: Vec<Bytes>,
}

impl OperationData {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffers: Vec::new(),
        }
    }

    #[must_use]
    pub const fn from_buffers(buffers: Vec<Bytes>) -> Self {
        Self { buffers }
    }

    /// Operation data holding exactly one buffer
    pub fn single(buffer: impl Into<Bytes>) -> Self {
        Self {
            buffers: vec![buffer.into()],
        }
    }

    pub fn push(&mut self, buffer: impl Into<Bytes>) {
        self.buffers.push(buffer.into());
    }

    #[must_use]
    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    #[must_use]
    pub fn into_buffers(self) -> Vec<Bytes> {
        self.buffers
    }

    #[must_use]
    pub fn first(&self) -> Option<&Bytes> {
        self.buffers.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total payload size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }
}

impl From<Vec<Bytes>> for OperationData {
    fn from(buffers: Vec<Bytes>) -> Self {
        Self::from_buffers(buffers)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T, what: &str) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(format!("failed to encode {what}: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Deserialization(format!("failed to decode {what}: {e}")))
}

fn single_buffer<'a>(data: &'a OperationData, what: &str) -> Result<&'a Bytes> {
    match data.buffers() {
        [buffer] => Ok(buffer),
        buffers => Err(Error::Deserialization(format!(
            "{what} expects one buffer, found {}",
            buffers.len()
        ))),
    }
}

/// Kind of structural change carried by a metadata operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyType {
    Insert,
    Delete,
}

impl ApplyType {
    /// The operation that undoes this one
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Insert => Self::Delete,
            Self::Delete => Self::Insert,
        }
    }
}

/// Identity of the state provider a structural change applies to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOperationData {
    version: u32,
    pub state_provider_id: StateProviderId,
    pub name: String,
    pub apply_type: ApplyType,
}

impl MetadataOperationData {
    pub fn new(state_provider_id: StateProviderId, name: impl Into<String>, apply_type: ApplyType) -> Self {
        Self {
            version: OPERATION_DATA_VERSION,
            state_provider_id,
            name: name.into(),
            apply_type,
        }
    }

    pub fn to_operation_data(&self) -> Result<OperationData> {
        Ok(OperationData::single(encode(self, "metadata operation")?))
    }

    pub fn from_operation_data(data: &OperationData) -> Result<Self> {
        let decoded: Self = decode(single_buffer(data, "metadata operation")?, "metadata operation")?;
        if decoded.version != OPERATION_DATA_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported metadata operation version {}",
                decoded.version
            )));
        }
        Ok(decoded)
    }
}

/// Information needed to recreate a state provider when an insert is replayed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoOperationData {
    version: u32,
    pub type_name: String,
    pub init_parameters: Option<Vec<u8>>,
    pub parent_id: StateProviderId,
}

impl RedoOperationData {
    pub fn new(
        type_name: impl Into<String>,
        init_parameters: Option<&Bytes>,
        parent_id: StateProviderId,
    ) -> Self {
        Self {
            version: OPERATION_DATA_VERSION,
            type_name: type_name.into(),
            init_parameters: init_parameters.map(|b| b.to_vec()),
            parent_id,
        }
    }

    #[must_use]
    pub fn init_parameters(&self) -> Option<Bytes> {
        self.init_parameters.clone().map(Bytes::from)
    }

    pub fn to_operation_data(&self) -> Result<OperationData> {
        Ok(OperationData::single(encode(self, "redo operation")?))
    }

    pub fn from_operation_data(data: &OperationData) -> Result<Self> {
        decode(single_buffer(data, "redo operation")?, "redo operation")
    }
}

#[derive(Serialize, Deserialize)]
struct NamedHeader {
    version: u32,
    state_provider_id: StateProviderId,
    has_user_data: bool,
}

/// Operation data tagged with the id of the state provider that owns it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedOperationData {
    pub state_provider_id: StateProviderId,
    pub user_data: Option<OperationData>,
}

impl NamedOperationData {
    #[must_use]
    pub const fn new(state_provider_id: StateProviderId, user_data: Option<OperationData>) -> Self {
        Self {
            state_provider_id,
            user_data,
        }
    }

    /// Header buffer followed by the user buffers
    pub fn to_operation_data(&self) -> Result<OperationData> {
        let header = NamedHeader {
            version: OPERATION_DATA_VERSION,
            state_provider_id: self.state_provider_id,
            has_user_data: self.user_data.is_some(),
        };
        let mut data = OperationData::single(encode(&header, "named operation header")?);
        if let Some(user) = &self.user_data {
            for buffer in user.buffers() {
                data.push(buffer.clone());
            }
        }
        Ok(data)
    }

    pub fn from_operation_data(data: &OperationData) -> Result<Self> {
        let (header, rest) = data
            .buffers()
            .split_first()
            .ok_or_else(|| Error::Deserialization("named operation has no header".into()))?;
        let header: NamedHeader = decode(header, "named operation header")?;
        if header.version != OPERATION_DATA_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported named operation version {}",
                header.version
            )));
        }
        let user_data = header
            .has_user_data
            .then(|| OperationData::from_buffers(rest.to_vec()));
        Ok(Self::new(header.state_provider_id, user_data))
    }
}
