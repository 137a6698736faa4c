//! # Kernel synchronization primitives
//!
//! A single lock type, [`SpinLock`], used by the memory manager. Its contended
//! path does not call into the scheduler directly; the scheduler's yield
//! function is handed to the lock as a [`YieldHook`] when it is built.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard, YieldHook};
