// src/slab.rs
//! Generation-tagged handles for pooled, heap-pinned objects.
//!
//! The kernel event queue stores a 64-bit token per registration. A token is
//! `generation << 32 | index`; removing an entry bumps its generation, so any
//! event still carrying the old token no longer resolves and is dropped
//! without touching the object.

use crate::pool::Pool;
use std::io;

pub type Token = u64;

#[inline(always)]
pub fn pack(index: u32, generation: u32) -> Token {
    ((generation as u64) << 32) | index as u64
}

#[inline(always)]
pub fn unpack(token: Token) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

struct Entry<T> {
    generation: u32,
    item: Option<Box<T>>,
}

/// Slot table over a [`Pool`] of boxed objects.
///
/// Objects are boxed so their address never changes while registered, and
/// they go back to the pool on removal instead of being dropped.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    pool: Pool<Box<T>>,
    active: usize,
}

impl<T> Slab<T> {
    pub fn new(pool: Pool<Box<T>>) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            pool,
            active: 0,
        }
    }

    /// Take an object from the pool and give it a slot.
    pub fn insert(&mut self) -> io::Result<(Token, &mut T)> {
        let item = self.pool.get()?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.entries.len() >= u32::MAX as usize - 16 {
                    self.pool.put(item);
                    return Err(io::Error::from_raw_os_error(libc::ENOMEM));
                }
                self.entries.push(Entry {
                    generation: 0,
                    item: None,
                });
                (self.entries.len() - 1) as u32
            }
        };

        let entry = &mut self.entries[index as usize];
        let token = pack(index, entry.generation);
        self.active += 1;
        let item = entry.item.insert(item);
        Ok((token, &mut **item))
    }

    /// Resolve a token; stale or unknown tokens yield `None`.
    #[inline]
    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        let (index, generation) = unpack(token);
        let entry = self.entries.get_mut(index as usize)?;
        if entry.generation != generation {
            return None;
        }
        entry.item.as_deref_mut()
    }

    pub fn contains(&self, token: Token) -> bool {
        let (index, generation) = unpack(token);
        self.entries
            .get(index as usize)
            .is_some_and(|e| e.generation == generation && e.item.is_some())
    }

    /// Detach the object behind `token` and invalidate the token.
    ///
    /// The caller cleans the object up and hands it back with [`Slab::release`].
    pub fn remove(&mut self, token: Token) -> Option<Box<T>> {
        let (index, generation) = unpack(token);
        let entry = self.entries.get_mut(index as usize)?;
        if entry.generation != generation {
            return None;
        }
        let item = entry.item.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index);
        self.active -= 1;
        Some(item)
    }

    pub fn release(&mut self, item: Box<T>) {
        self.pool.put(item);
    }

    /// Tokens of every live entry.
    pub fn tokens(&self) -> Vec<Token> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.item.is_some())
            .map(|(i, e)| pack(i as u32, e.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Idle objects waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Objects ever constructed; bounded by the peak number of live entries.
    pub fn created(&self) -> usize {
        self.pool.created()
    }
}
