use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::consts::CAP_THREAD_LIST;

/// Stable reference to an entry of a [`ThreadList`].
///
/// Keys carry the generation of the slot they were issued for, so a key
/// outliving its entry never resolves to a later occupant of the same slot.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ListKey {
  index: u32,
  generation: u32,
}

struct Entry<T> {
  generation: u32,
  value: Option<T>,
  prev: Option<u32>,
  /// Next live entry, or next free slot while vacant.
  next: Option<u32>,
}

struct Arena<T> {
  entries: Vec<Entry<T>>,
  head: Option<u32>,
  tail: Option<u32>,
  free: Option<u32>,
  len: usize,
}

/// The list of live thread contexts of a process.
///
/// An arena of entries linked in insertion order, plus a free list of
/// vacant slots. Insertion and removal are O(1) and serialized by one lock.
pub struct ThreadList<T> {
  inner: Mutex<Arena<T>>,
}

impl<T> ThreadList<T> {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Arena {
        entries: Vec::with_capacity(CAP_THREAD_LIST),
        head: None,
        tail: None,
        free: None,
        len: 0,
      }),
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Appends `value` and returns its key.
  pub fn insert(&self, value: T) -> ListKey {
    let mut arena = self.inner.lock();
    let arena: &mut Arena<T> = &mut arena;
    let prev: Option<u32> = arena.tail;

    let index: u32 = match arena.free {
      Some(index) => {
        let entry: &mut Entry<T> = &mut arena.entries[index as usize];

        arena.free = entry.next;
        entry.value = Some(value);
        entry.prev = prev;
        entry.next = None;

        index
      }
      None => {
        let index: u32 = arena.entries.len() as u32;

        arena.entries.push(Entry {
          generation: 0,
          value: Some(value),
          prev,
          next: None,
        });

        index
      }
    };

    match prev {
      Some(prev) => arena.entries[prev as usize].next = Some(index),
      None => arena.head = Some(index),
    }

    arena.tail = Some(index);
    arena.len += 1;

    ListKey {
      index,
      generation: arena.entries[index as usize].generation,
    }
  }

  /// Unlinks the entry for `key` and returns its value.
  ///
  /// Returns `None` if the key is stale.
  pub fn remove(&self, key: ListKey) -> Option<T> {
    let mut arena = self.inner.lock();
    let arena: &mut Arena<T> = &mut arena;

    let entry: &mut Entry<T> = arena.entries.get_mut(key.index as usize)?;

    if entry.generation != key.generation || entry.value.is_none() {
      return None;
    }

    let value: Option<T> = entry.value.take();
    let prev: Option<u32> = entry.prev.take();
    let next: Option<u32> = entry.next.take();

    entry.generation = entry.generation.wrapping_add(1);
    entry.next = arena.free;
    arena.free = Some(key.index);

    match prev {
      Some(prev) => arena.entries[prev as usize].next = next,
      None => arena.head = next,
    }

    match next {
      Some(next) => arena.entries[next as usize].prev = prev,
      None => arena.tail = prev,
    }

    arena.len -= 1;

    value
  }

  /// Returns `true` if `key` refers to a live entry.
  pub fn contains(&self, key: ListKey) -> bool {
    self
      .inner
      .lock()
      .entries
      .get(key.index as usize)
      .is_some_and(|entry| entry.generation == key.generation && entry.value.is_some())
  }

  /// Returns the keys of all entries, head to tail.
  pub fn order(&self) -> Vec<ListKey> {
    let arena = self.inner.lock();
    let mut keys: Vec<ListKey> = Vec::with_capacity(arena.len);
    let mut cursor: Option<u32> = arena.head;

    while let Some(index) = cursor {
      let entry: &Entry<T> = &arena.entries[index as usize];

      keys.push(ListKey {
        index,
        generation: entry.generation,
      });

      cursor = entry.next;
    }

    keys
  }
}

impl<T: Clone> ThreadList<T> {
  /// Returns the value for `key`.
  pub fn get(&self, key: ListKey) -> Option<T> {
    self
      .inner
      .lock()
      .entries
      .get(key.index as usize)
      .filter(|entry| entry.generation == key.generation)
      .and_then(|entry| entry.value.clone())
  }

  /// Returns the first value, head to tail, matching `predicate`.
  pub fn find<P>(&self, mut predicate: P) -> Option<T>
  where
    P: FnMut(&T) -> bool,
  {
    let arena = self.inner.lock();
    let mut cursor: Option<u32> = arena.head;

    while let Some(index) = cursor {
      let entry: &Entry<T> = &arena.entries[index as usize];

      if let Some(value) = entry.value.as_ref().filter(|value| predicate(value)) {
        return Some(value.clone());
      }

      cursor = entry.next;
    }

    None
  }

  /// Returns every value, head to tail.
  pub fn snapshot(&self) -> Vec<T> {
    let arena = self.inner.lock();
    let mut values: Vec<T> = Vec::with_capacity(arena.len);
    let mut cursor: Option<u32> = arena.head;

    while let Some(index) = cursor {
      let entry: &Entry<T> = &arena.entries[index as usize];
      values.extend(entry.value.clone());
      cursor = entry.next;
    }

    values
  }
}

impl<T> Default for ThreadList<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Debug for ThreadList<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_list().entries(self.order()).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::tls::ListKey;
  use crate::tls::ThreadList;

  #[test]
  fn test_insert_remove_round_trip() {
    let list: ThreadList<u32> = ThreadList::new();
    let a: ListKey = list.insert(1);
    let b: ListKey = list.insert(2);
    let c: ListKey = list.insert(3);
    let before: Vec<ListKey> = list.order();

    let key: ListKey = list.insert(99);

    assert_eq!(list.len(), 4);
    assert_eq!(list.snapshot(), [1, 2, 3, 99]);
    assert_eq!(list.remove(key), Some(99));
    assert_eq!(list.order(), before);

    assert_eq!(list.remove(b), Some(2));
    assert_eq!(list.order(), [a, c]);

    // The vacated slot is reused without disturbing the survivors.
    let d: ListKey = list.insert(4);

    assert_eq!(list.order(), [a, c, d]);
    assert_eq!(list.remove(d), Some(4));
    assert_eq!(list.order(), [a, c]);
  }

  #[test]
  fn test_remove_middle_head_tail() {
    let list: ThreadList<&str> = ThreadList::new();
    let keys: Vec<ListKey> = ["a", "b", "c", "d"].into_iter().map(|v| list.insert(v)).collect();

    assert_eq!(list.remove(keys[1]), Some("b"));
    assert_eq!(list.remove(keys[0]), Some("a"));
    assert_eq!(list.remove(keys[3]), Some("d"));
    assert_eq!(list.snapshot(), ["c"]);
    assert_eq!(list.remove(keys[2]), Some("c"));
    assert!(list.is_empty());
    assert!(list.order().is_empty());
  }

  #[test]
  fn test_stale_key_rejected() {
    let list: ThreadList<u32> = ThreadList::new();
    let old: ListKey = list.insert(1);

    list.remove(old);

    let new: ListKey = list.insert(2);

    assert_ne!(old, new);
    assert!(!list.contains(old));
    assert_eq!(list.remove(old), None);
    assert_eq!(list.get(old), None);
    assert_eq!(list.get(new), Some(2));
  }

  #[test]
  fn test_find() {
    let list: ThreadList<u32> = ThreadList::new();

    list.insert(3);
    list.insert(8);
    list.insert(10);

    assert_eq!(list.find(|value| value % 2 == 0), Some(8));
    assert_eq!(list.find(|value| *value > 10), None);
  }
}
