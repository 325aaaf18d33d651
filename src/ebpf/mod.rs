pub mod attach;
pub mod events;
pub mod loader;
pub mod maps;
pub mod ringbuf;

pub use attach::{exercise_init_guard, run_callbacks, ProgramRunner};
pub use events::{decode_event, encode_event, DecodeError, EventRow, EVENT_SIZE};
pub use maps::{init_state, MemoryStateMap, PinnedMap, StateMap};
pub use ringbuf::{
    consume, ChannelSource, CloseHandle, ConsumeSummary, ConsumerError, EventConsumer, Next,
    OutputFormat, RecordSource,
};
