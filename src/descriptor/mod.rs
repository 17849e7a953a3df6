//! 包描述文件 — 声明源码位置、安装动作、定时任务与冒烟测试

pub mod parser;
pub mod types;

pub use parser::{load_descriptor, parse_descriptor, to_toml};
pub use types::{
    CalendarTrigger, InstallAction, LocationKind, PackageDescriptor, ServiceSchedule, Source,
    VerificationStep,
};
