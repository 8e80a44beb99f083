//! Domain - ドメインモデル（ids, task, state, status, desc, intent, errors）

pub mod desc;
pub mod errors;
pub mod ids;
pub mod intent;
pub mod state;
pub mod status;
pub mod task;

pub use desc::{DescriptorError, Descriptors, FilterDesc, ImageFormat, RenderDesc};
pub use errors::{ErrorKind, TaskError};
pub use ids::{FileHandle, TaskId, TaskIdAllocator};
pub use intent::{ExitStatus, GlobalIntent};
pub use state::{SubTaskKind, TaskState};
pub use status::{ExecStatus, ExitKind, ResourceUsage};
pub use task::{FilterSubTask, RenderSubTask, TaskRecord};
