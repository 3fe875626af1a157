//! Wire format for octants and their user data.
//!
//! A message is a `u64` record count followed by that many [OctantRecord]s
//! and then the raw bytes of the same number of data items. Zero-sized data
//! contributes no bytes.

use bytemuck::{Pod, Zeroable};

use crate::{
    constants::MAX_LEVEL,
    error::ForestError,
    forest::TreeOctant,
    octant::Octant,
    tools::decode_pod,
};

/// Plain representation of a tree octant on the wire.
#[derive(Copy, Clone, Pod, Zeroable, Debug)]
#[repr(C)]
pub struct OctantRecord {
    tree: u32,
    coordinates: [u32; 3],
    level: u32,
}

impl From<&TreeOctant> for OctantRecord {
    fn from(value: &TreeOctant) -> Self {
        Self {
            tree: value.tree as u32,
            coordinates: value.octant.coordinates(),
            level: value.octant.level() as u32,
        }
    }
}

impl OctantRecord {
    pub(crate) fn to_tree_octant(self, num_trees: usize) -> Result<TreeOctant, ForestError> {
        if self.tree as usize >= num_trees {
            return Err(ForestError::Codec(format!(
                "tree {} out of range for {} trees",
                self.tree, num_trees
            )));
        }
        if self.level > MAX_LEVEL as u32 {
            return Err(ForestError::Codec(format!("level {} out of range", self.level)));
        }

        let octant = Octant::try_new(self.coordinates, self.level as u8).ok_or_else(|| {
            ForestError::Codec(format!(
                "coordinates {:?} are not aligned to level {}",
                self.coordinates, self.level
            ))
        })?;

        Ok(TreeOctant::new(self.tree as usize, octant))
    }
}

/// Encode tree octants with one data item each.
pub fn encode<D: Pod>(octants: &[TreeOctant], data: &[D]) -> Vec<u8> {
    assert_eq!(octants.len(), data.len());

    let records = octants.iter().map(OctantRecord::from).collect::<Vec<_>>();
    let record_bytes: &[u8] = bytemuck::cast_slice(&records);
    let data_bytes: &[u8] = if std::mem::size_of::<D>() == 0 {
        &[]
    } else {
        bytemuck::cast_slice(data)
    };

    let mut buffer = Vec::with_capacity(8 + record_bytes.len() + data_bytes.len());
    buffer.extend_from_slice(&(octants.len() as u64).to_le_bytes());
    buffer.extend_from_slice(record_bytes);
    buffer.extend_from_slice(data_bytes);
    buffer
}

/// Decode a message produced by [encode].
///
/// Every octant is checked to be valid and to belong to one of `num_trees` trees.
pub fn decode<D: Pod>(
    bytes: &[u8],
    num_trees: usize,
) -> Result<(Vec<TreeOctant>, Vec<D>), ForestError> {
    if bytes.len() < 8 {
        return Err(ForestError::Codec("message is shorter than its header".to_string()));
    }
    let (header, body) = bytes.split_at(8);
    let count = u64::from_le_bytes(header.try_into().map_err(|_| {
        ForestError::Codec("message header is not eight bytes".to_string())
    })?);

    let too_long = || ForestError::Codec(format!("header announces {} octants", count));
    let count = usize::try_from(count).map_err(|_| too_long())?;
    let record_len = count
        .checked_mul(std::mem::size_of::<OctantRecord>())
        .ok_or_else(too_long)?;
    let data_len = count
        .checked_mul(std::mem::size_of::<D>())
        .ok_or_else(too_long)?;
    let expected = record_len.checked_add(data_len).ok_or_else(too_long)?;
    if body.len() != expected {
        return Err(ForestError::Codec(format!(
            "expected {} bytes for {} octants, found {}",
            expected,
            count,
            body.len()
        )));
    }

    let (record_bytes, data_bytes) = body.split_at(record_len);

    let octants = decode_pod::<OctantRecord>(record_bytes)
        .ok_or_else(|| ForestError::Codec("truncated octant records".to_string()))?
        .into_iter()
        .map(|record| record.to_tree_octant(num_trees))
        .collect::<Result<Vec<_>, _>>()?;

    let data = if std::mem::size_of::<D>() == 0 {
        vec![D::zeroed(); count]
    } else {
        decode_pod::<D>(data_bytes)
            .ok_or_else(|| ForestError::Codec("truncated user data".to_string()))?
    };

    Ok((octants, data))
}
