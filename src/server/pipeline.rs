//! Ordered set of in-flight transaction contexts of one connection.

use crate::{
    errors::ErrorKind,
    server::context::{ContextHandle, TransactionContext},
};
use std::collections::VecDeque;

#[derive(Debug)]
struct Slot {
    generation: u32,
    context: Option<TransactionContext>,
}

/// FIFO of contexts in arrival order, stored in a generational arena.
///
/// The head is the only context allowed to write, the tail the only one
/// allowed to trigger a read. Both flags are recomputed on every change.
#[derive(Debug, Default)]
pub(crate) struct Pipeline {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: VecDeque<ContextHandle>,
}

impl Pipeline {
    /// Appends `context` at the tail.
    pub(crate) fn register(&mut self, context: TransactionContext) -> ContextHandle {
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.context = Some(context);
                ContextHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    context: Some(context),
                });
                ContextHandle { index, generation: 0 }
            }
        };

        self.order.push_back(handle);
        self.recompute();
        handle
    }

    pub(crate) fn get(&self, handle: ContextHandle) -> Result<&TransactionContext, ErrorKind> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.context.as_ref())
            .ok_or(ErrorKind::ContextGone)
    }

    pub(crate) fn get_mut(
        &mut self,
        handle: ContextHandle,
    ) -> Result<&mut TransactionContext, ErrorKind> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.context.as_mut())
            .ok_or(ErrorKind::ContextGone)
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<ContextHandle> {
        self.order.front().copied()
    }

    #[inline]
    pub(crate) fn tail(&self) -> Option<ContextHandle> {
        self.order.back().copied()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = ContextHandle> + '_ {
        self.order.iter().copied()
    }

    /// Removes the head; the next context becomes head.
    pub(crate) fn remove_head(&mut self) -> Option<(ContextHandle, TransactionContext)> {
        let handle = self.order.pop_front()?;
        let context = self.take(handle)?;

        self.recompute();
        Some((handle, context))
    }

    /// Removes every context, head first.
    pub(crate) fn drain(&mut self) -> Vec<(ContextHandle, TransactionContext)> {
        let order: Vec<_> = self.order.drain(..).collect();

        order
            .into_iter()
            .filter_map(|handle| Some((handle, self.take(handle)?)))
            .collect()
    }

    fn take(&mut self, handle: ContextHandle) -> Option<TransactionContext> {
        let context = self.slots.get_mut(handle.index as usize)?.context.take()?;
        self.free.push(handle.index);
        Some(context)
    }

    fn recompute(&mut self) {
        let (head, tail) = (self.head(), self.tail());

        for &handle in &self.order {
            if let Some(ctx) = self.slots[handle.index as usize].context.as_mut() {
                ctx.may_write = Some(handle) == head;
                ctx.may_read = Some(handle) == tail;
            }
        }
    }
}
