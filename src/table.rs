// Copyright (c) 2017-2021 Fabian Schuiki

//! Dense tables keyed by opaque ids.
//!
//! Every analysis result in this crate refers to instructions, blocks, loops,
//! and conditionals through small integer ids. The ids are handed out in
//! ascending order by a `DenseTable`, which stores the associated data in a
//! flat vector.

use serde::{Serialize, Serializer};
use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
};

/// An opaque key to uniquely identify a table entry.
pub trait TableKey: Copy {
    /// Create a new table key from an index.
    fn new(index: usize) -> Self;
    /// Return the index wrapped within this table key.
    fn index(self) -> usize;
}

/// Generate a new opaque table key struct.
#[macro_export]
macro_rules! impl_table_key {
    ($($(#[$m:meta])* struct $name:ident($ity:ty) as $display_prefix:expr;)*) => {
        $(
            $(#[$m])*
            #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name($ity);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    write!(f, "{}{}", $display_prefix, self.0)
                }
            }

            impl std::fmt::Debug for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                    write!(f, "{}", self)
                }
            }

            impl serde::Serialize for $name {
                fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                    s.serialize_u64(self.0 as u64)
                }
            }

            impl $crate::table::TableKey for $name {
                fn new(index: usize) -> Self {
                    $name(index as $ity)
                }

                fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

/// A table that assigns consecutive ids to the values added to it.
#[derive(Debug, Clone)]
pub struct DenseTable<I, V> {
    storage: Vec<V>,
    unused: PhantomData<I>,
}

impl<I, V> DenseTable<I, V> {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            unused: PhantomData,
        }
    }

    /// Return the number of entries in the table.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<I, V> Default for DenseTable<I, V> {
    fn default() -> DenseTable<I, V> {
        DenseTable::new()
    }
}

impl<I: TableKey, V> DenseTable<I, V> {
    /// Add a new entry to the table.
    ///
    /// Returns the key under which the entry can be accessed again.
    pub fn add(&mut self, value: V) -> I {
        let index = self.storage.len();
        self.storage.push(value);
        I::new(index)
    }

    /// Get an entry from the table, if one exists.
    pub fn get(&self, key: I) -> Option<&V> {
        self.storage.get(key.index())
    }

    /// Return an iterator over the keys and values in the table.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (I, &'a V)> + 'a {
        self.storage.iter().enumerate().map(|(k, v)| (I::new(k), v))
    }

    /// Return an iterator over the keys in the table.
    pub fn keys(&self) -> impl Iterator<Item = I> + Clone {
        (0..self.storage.len()).map(I::new)
    }

    /// Return an iterator over the values in the table.
    pub fn values<'a>(&'a self) -> impl Iterator<Item = &'a V> + 'a {
        self.storage.iter()
    }
}

impl<I: TableKey, V> Index<I> for DenseTable<I, V> {
    type Output = V;

    fn index(&self, idx: I) -> &V {
        &self.storage[idx.index()]
    }
}

impl<I: TableKey, V> IndexMut<I> for DenseTable<I, V> {
    fn index_mut(&mut self, idx: I) -> &mut V {
        &mut self.storage[idx.index()]
    }
}

impl<I, V: Serialize> Serialize for DenseTable<I, V> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.storage.serialize(s)
    }
}
