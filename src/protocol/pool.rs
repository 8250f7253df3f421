//! Body buffer pools for hot message types
//!
//! Receiving a frame means filling a body buffer of up to `MAX_BODY_LEN`
//! bytes; the hot message types (CommonResponse, DataBlock, UploadFile,
//! Hello, Auth) arrive thousands of times per sync, so their buffers are
//! recycled through a per-type free list instead of reallocated. Recycling
//! the same buffer twice is tolerated: the pool just holds two spares.

use std::sync::{Mutex, OnceLock};

use crate::protocol::MessageType;

/// How many idle buffers a single pool retains
const MAX_IDLE: usize = 32;

/// A free list of reusable byte buffers
pub struct BufferPool {
	free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
	pub const fn new() -> Self {
		BufferPool { free: Mutex::new(Vec::new()) }
	}

	/// Take a cleared buffer with at least `capacity` bytes reserved
	pub fn acquire(&self, capacity: usize) -> Vec<u8> {
		let recycled = {
			let mut free = match self.free.lock() {
				Ok(free) => free,
				Err(poisoned) => poisoned.into_inner(),
			};
			free.pop()
		};
		match recycled {
			Some(mut buf) => {
				buf.clear();
				if buf.capacity() < capacity {
					buf.reserve(capacity - buf.capacity());
				}
				buf
			}
			None => Vec::with_capacity(capacity),
		}
	}

	/// Return a buffer to the free list
	pub fn recycle(&self, buf: Vec<u8>) {
		let mut free = match self.free.lock() {
			Ok(free) => free,
			Err(poisoned) => poisoned.into_inner(),
		};
		if free.len() < MAX_IDLE {
			free.push(buf);
		}
	}

	#[cfg(test)]
	fn idle_count(&self) -> usize {
		self.free.lock().map(|f| f.len()).unwrap_or(0)
	}
}

struct Pools {
	hello: BufferPool,
	auth: BufferPool,
	upload_file: BufferPool,
	common_response: BufferPool,
	data_block: BufferPool,
}

static POOLS: OnceLock<Pools> = OnceLock::new();

fn pools() -> &'static Pools {
	POOLS.get_or_init(|| Pools {
		hello: BufferPool::new(),
		auth: BufferPool::new(),
		upload_file: BufferPool::new(),
		common_response: BufferPool::new(),
		data_block: BufferPool::new(),
	})
}

/// The pool serving a message type, if it is one of the hot types
pub fn pool_for(msg_type: MessageType) -> Option<&'static BufferPool> {
	let pools = pools();
	match msg_type {
		MessageType::Hello => Some(&pools.hello),
		MessageType::Auth => Some(&pools.auth),
		MessageType::UploadFile => Some(&pools.upload_file),
		MessageType::CommonResponse => Some(&pools.common_response),
		MessageType::DataBlock => Some(&pools.data_block),
		_ => None,
	}
}

/// Take a body buffer for the given type, pooled when hot
pub fn acquire_body(msg_type: MessageType, capacity: usize) -> Vec<u8> {
	match pool_for(msg_type) {
		Some(pool) => pool.acquire(capacity),
		None => Vec::with_capacity(capacity),
	}
}

/// Hand a body buffer back once its message is decoded
pub fn recycle_body(msg_type: MessageType, buf: Vec<u8>) {
	if let Some(pool) = pool_for(msg_type) {
		pool.recycle(buf);
	}
}


// vim: ts=4
