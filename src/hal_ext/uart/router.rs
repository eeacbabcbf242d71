//! Interrupt vector to channel mapping

use core::cell::Cell;

use critical_section::Mutex;

use crate::hal::pac::Interrupt;
use super::port::Id;

/// Object that services interrupts of a serial peripheral
pub trait InterruptHandler: Sync {
    fn on_interrupt(&self);
    fn on_dma_interrupt(&self);
}

type Handlers = [Option<&'static dyn InterruptHandler>; Id::COUNT];

/// Table of channels indexed by peripheral
///
/// Handlers are always called outside of the critical section so that they
/// can take their own locks and dispatch callbacks.
pub struct Router {
    handlers: Mutex<Cell<Handlers>>,
}

/// Router used by [`Uart::init`](super::Uart::init)
pub static ROUTER: Router = Router::new();

impl Router {
    pub const fn new() -> Self {
        Self { handlers: Mutex::new(Cell::new([None; Id::COUNT])) }
    }

    /// Replace the handler for `id`
    pub fn register(&self, id: Id, handler: &'static dyn InterruptHandler) {
        critical_section::with(|cs| {
            let cell = self.handlers.borrow(cs);
            let mut handlers = cell.get();
            handlers[id.index()] = Some(handler);
            cell.set(handlers);
        });
    }

    pub fn unregister(&self, id: Id) {
        critical_section::with(|cs| {
            let cell = self.handlers.borrow(cs);
            let mut handlers = cell.get();
            handlers[id.index()] = None;
            cell.set(handlers);
        });
    }

    pub fn handler(&self, id: Id) -> Option<&'static dyn InterruptHandler> {
        critical_section::with(|cs| self.handlers.borrow(cs).get()[id.index()])
    }

    /// Peripheral interrupt of `id`, ignored if nothing is registered
    pub fn on_interrupt(&self, id: Id) {
        if let Some(handler) = self.handler(id) {
            handler.on_interrupt();
        }
    }

    /// Dispatch NVIC vector to all peripherals that share it
    pub fn on_vector(&self, irq: Interrupt) {
        for id in Id::ALL.into_iter().filter(|id| id.interrupt() == irq) {
            self.on_interrupt(id);
        }
    }

    /// DMA interrupt, each registered channel checks its own DMA flags
    pub fn on_dma_interrupt(&self) {
        let handlers = critical_section::with(|cs| self.handlers.borrow(cs).get());
        for handler in handlers.into_iter().flatten() {
            handler.on_dma_interrupt();
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        irq: AtomicUsize,
        dma: AtomicUsize,
    }

    impl InterruptHandler for Counter {
        fn on_interrupt(&self) {
            self.irq.fetch_add(1, Ordering::SeqCst);
        }

        fn on_dma_interrupt(&self) {
            self.dma.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> &'static Counter {
        Box::leak(Box::default())
    }

    fn counts(c: &Counter) -> (usize, usize) {
        (c.irq.load(Ordering::SeqCst), c.dma.load(Ordering::SeqCst))
    }

    #[test]
    fn dispatch_to_registered() {
        let router = Router::new();
        let (a, b) = (counter(), counter());
        router.register(Id::Usart1, a);
        router.register(Id::Usart2, b);

        router.on_interrupt(Id::Usart1);
        router.on_interrupt(Id::Usart1);
        router.on_vector(Interrupt::USART2);
        assert_eq!(counts(a), (2, 0));
        assert_eq!(counts(b), (1, 0));
    }

    #[test]
    fn unregistered_is_ignored() {
        let router = Router::new();
        let a = counter();
        router.on_interrupt(Id::Usart3);
        router.on_vector(Interrupt::USART3_4);
        router.on_dma_interrupt();

        router.register(Id::Usart3, a);
        router.unregister(Id::Usart3);
        router.on_interrupt(Id::Usart3);
        assert!(router.handler(Id::Usart3).is_none());
        assert_eq!(counts(a), (0, 0));
    }

    #[test]
    fn shared_vector_reaches_both() {
        let router = Router::new();
        let (a, b, c) = (counter(), counter(), counter());
        router.register(Id::Usart3, a);
        router.register(Id::Usart4, b);
        router.register(Id::Usart1, c);

        router.on_vector(Interrupt::USART3_4);
        assert_eq!(counts(a), (1, 0));
        assert_eq!(counts(b), (1, 0));
        assert_eq!(counts(c), (0, 0));
    }

    #[test]
    fn register_replaces() {
        let router = Router::new();
        let (a, b) = (counter(), counter());
        router.register(Id::Usart2, a);
        router.register(Id::Usart2, b);
        router.on_interrupt(Id::Usart2);
        assert_eq!(counts(a), (0, 0));
        assert_eq!(counts(b), (1, 0));
    }

    #[test]
    fn dma_interrupt_reaches_all() {
        let router = Router::new();
        let (a, b) = (counter(), counter());
        router.register(Id::Usart1, a);
        router.register(Id::Usart4, b);
        router.on_dma_interrupt();
        assert_eq!(counts(a), (0, 1));
        assert_eq!(counts(b), (0, 1));
    }
}
