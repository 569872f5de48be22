// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The tag table: named bindings of PLC addresses to typed host values.
//!
//! Names are case-insensitive and unique; the table maps names to tags and
//! nothing else. Mutations go through short-lived shard locks; the polling
//! engine takes a snapshot of the name list and never holds a lock across
//! I/O.

use std::str::FromStr;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    addr::{Area, TagAddress, Width},
    error::S7Error,
    frames::var::VarSpec,
    values::{S7Value, TagType},
};

/// One tag descriptor plus its last decoded and pending values.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Name as declared (original case preserved for display).
    pub name: String,
    /// Decoded address.
    pub address: TagAddress,
    /// Address as declared.
    pub address_text: String,
    pub ty: TagType,
    /// Element count; 1 for scalars.
    pub array_length: u16,
    /// Most recent successfully decoded value.
    pub value: Option<S7Value>,
    /// Value to write on the next Write dispatch; consumed on success.
    pub pending_value: Option<S7Value>,
    /// Excluded from the polling scan (still readable synchronously).
    pub do_not_poll: bool,
}

impl Tag {
    /// Total wire width of this tag.
    pub fn width_bytes(&self) -> u16 {
        self.ty.wire_bytes(self.array_length)
    }

    /// Variable specification covering the whole tag.
    pub fn var_spec(&self) -> VarSpec {
        let a = self.address;
        if a.area.is_indexed() {
            VarSpec {
                area: a.area,
                db: 0,
                start: a.byte,
                bit: None,
                count: self.array_length,
            }
        } else if self.ty == TagType::Bool {
            VarSpec {
                area: a.area,
                db: a.db,
                start: a.byte,
                bit: Some(a.bit.unwrap_or(0)),
                count: self.array_length,
            }
        } else {
            VarSpec::bytes_at(a.area, a.db, a.byte, self.width_bytes())
        }
    }
}

/// Case-insensitive name → [`Tag`] map.
#[derive(Debug, Default)]
pub struct TagTable {
    inner: DashMap<String, Tag>,
}

impl TagTable {
    pub fn new() -> Self {
        TagTable::default()
    }

    /// Register a tag or update an existing declaration.
    ///
    /// A tag that has already decoded a value keeps its type for life:
    /// re-declaring it with a different type is rejected.
    pub fn insert_or_update(
        &self,
        name: &str,
        address_text: &str,
        ty: TagType,
        array_length: u16,
        do_not_poll: bool,
    ) -> Result<(), S7Error> {
        let address = TagAddress::from_str(address_text)?;
        validate_binding(&address, ty, array_length)?;

        let key = name.to_ascii_uppercase();
        let mut fresh = Tag {
            name: name.to_string(),
            address,
            address_text: address_text.to_string(),
            ty,
            array_length: array_length.max(1),
            value: None,
            pending_value: None,
            do_not_poll,
        };

        match self.inner.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.value.is_some() && existing.ty != ty {
                    return Err(S7Error::TypeMismatch {
                        expected: existing.ty.name(),
                        got: ty.name(),
                    });
                }
                if existing.ty == ty && existing.address == address {
                    fresh.value = existing.value.clone();
                    fresh.pending_value = existing.pending_value.clone();
                }
                slot.insert(fresh);
            },
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            },
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove(&name.to_ascii_uppercase()).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Tag> {
        self.inner
            .get(&name.to_ascii_uppercase())
            .map(|t| t.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Store a decoded value. Returns `Ok(true)` when the stored value
    /// changed, `Ok(false)` when it is unchanged; the declared type must
    /// match the decoded one.
    pub fn store_decoded(&self, name: &str, value: S7Value) -> Result<bool, S7Error> {
        let mut tag = self
            .inner
            .get_mut(&name.to_ascii_uppercase())
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;
        let changed = tag.value.as_ref() != Some(&value);
        tag.value = Some(value);
        Ok(changed)
    }

    /// Queue a value for the next write dispatch.
    pub fn set_pending(&self, name: &str, value: S7Value) -> Result<(), S7Error> {
        let mut tag = self
            .inner
            .get_mut(&name.to_ascii_uppercase())
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;
        tag.pending_value = Some(value);
        Ok(())
    }

    /// Consume the pending value of a tag, if any.
    pub fn take_pending(&self, name: &str) -> Option<(Tag, S7Value)> {
        let mut tag = self.inner.get_mut(&name.to_ascii_uppercase())?;
        let value = tag.pending_value.take()?;
        let descriptor = tag.value().clone();
        Some((descriptor, value))
    }

    /// Names of all tags pollable at call time, in no particular order
    /// beyond map iteration. The list is a copy: inserts after the call do
    /// not join an already-snapshotted scan.
    pub fn snapshot_pollable(&self) -> Vec<String> {
        self.inner
            .iter()
            .filter(|t| !t.do_not_poll)
            .map(|t| t.key().clone())
            .collect()
    }
}

/// Declaration-time invariants between the address, the type and the array
/// length.
fn validate_binding(
    address: &TagAddress,
    ty: TagType,
    array_length: u16,
) -> Result<(), S7Error> {
    if array_length > 1 && !ty.supports_arrays() {
        return Err(S7Error::ValueOutOfRange {
            ty: ty.name(),
            detail: "arrays are not supported for this type".to_string(),
        });
    }

    match ty {
        TagType::Bool => {
            if address.width != Width::Bit {
                return Err(S7Error::TypeMismatch {
                    expected: "bit address",
                    got: "byte address",
                });
            }
        },
        TagType::Counter => {
            if address.area != Area::Counter {
                return Err(S7Error::TypeMismatch {
                    expected: "counter address",
                    got: "non-counter area",
                });
            }
        },
        TagType::Timer => {
            if address.area != Area::Timer {
                return Err(S7Error::TypeMismatch {
                    expected: "timer address",
                    got: "non-timer area",
                });
            }
        },
        _ => {
            if address.width == Width::Bit {
                return Err(S7Error::TypeMismatch {
                    expected: "byte address",
                    got: "bit address",
                });
            }
            if address.area.is_indexed() {
                return Err(S7Error::TypeMismatch {
                    expected: "byte-addressed area",
                    got: "timer/counter area",
                });
            }
        },
    }
    Ok(())
}
