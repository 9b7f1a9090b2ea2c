//! Ordered FIFO container with an optional size limit.
//!
//! The limit is advisory: [`Queue::enqueue`] always accepts the item and
//! callers consult [`Queue::is_full`] before deciding to add more.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Queue<T> {
    storage: VecDeque<T>,
    size_limit: Option<usize>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            storage: VecDeque::new(),
            size_limit: None,
        }
    }

    pub fn bounded(size_limit: Option<usize>) -> Self {
        Self {
            storage: VecDeque::new(),
            size_limit,
        }
    }

    pub fn size_limit(&self) -> Option<usize> {
        self.size_limit
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// True once the queue holds at least `size_limit` items.
    pub fn is_full(&self) -> bool {
        self.size_limit
            .is_some_and(|limit| self.storage.len() >= limit)
    }

    pub fn enqueue(&mut self, item: T) {
        self.storage.push_back(item);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.storage.pop_front()
    }

    /// Remove the first item matching `predicate`.
    pub fn remove_by<P>(&mut self, predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let index = self.storage.iter().position(predicate)?;
        self.storage.remove(index)
    }

    /// Move the first item matching `predicate` to the back of the queue.
    pub fn requeue_by<P>(&mut self, predicate: P) -> bool
    where
        P: FnMut(&T) -> bool,
    {
        match self.remove_by(predicate) {
            Some(item) => {
                self.storage.push_back(item);
                true
            }
            None => false,
        }
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.storage.iter().find(|item| predicate(item))
    }

    pub fn find_mut<P>(&mut self, mut predicate: P) -> Option<&mut T>
    where
        P: FnMut(&T) -> bool,
    {
        self.storage.iter_mut().find(|item| predicate(item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.storage.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.storage.iter_mut()
    }

    /// Remove every item, front to back.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.storage.drain(..)
    }
}

impl<T: PartialEq> Queue<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.storage.contains(item)
    }

    pub fn remove(&mut self, item: &T) -> Option<T> {
        self.remove_by(|candidate| candidate == item)
    }

    pub fn requeue(&mut self, item: &T) -> bool {
        self.requeue_by(|candidate| candidate == item)
    }
}
