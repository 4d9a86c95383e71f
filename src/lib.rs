// streamio
//
// An asynchronous stream I/O subsystem: a hand-rolled epoll/kqueue
// event loop, non-blocking stream instances, a thread-pool adapter for
// blocking resources, byte-transforming filters, pipelined copies, and
// an ordered multi-segment output writer.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate errno;
extern crate libc;

#[macro_use]
mod err;
mod ffi;
mod reactor;

mod instance;
pub use self::instance::{Completion, IoHandler, IoInstance, IoMode, StreamInstance};

mod io_loop;
pub use self::io_loop::IoLoop;

mod stream;
pub use self::stream::{AsyncStream, IoStream};

mod simulator;
pub use self::simulator::{
    BlockingIo, BlockingReader, BlockingWriter, Dispatcher, StreamSimulator, ThreadPool,
};

mod filter;
pub use self::filter::{FilterStream, Identity, StreamTransform};

mod copy;
pub use self::copy::{AsyncCopy, CopyHandler, CopyParams, ReadHook};

mod output;
pub use self::output::{AsyncOutput, OutputBuffer, OutputHandler};
