// 更新生命周期模块

pub mod action;
pub mod admission;
pub mod controller;
pub mod device;
pub mod fetcher;
pub mod installer;
pub mod manifest;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod verifier;

pub use action::{primary_action, ActionContext, PrimaryAction, UpdateAction};
pub use admission::{AdmissionSlot, CheckCoordinator, CheckGuard, PipelineStage};
pub use controller::{
    ActionOutcome, ControllerOptions, ControllerPorts, ControllerStatus, UpdateController,
    UpdateView, UpdaterSettings,
};
pub use device::{BatteryState, DevicePolicy, InstallTopology, LinuxDevicePolicy};
pub use fetcher::{
    ByteStream, FetchEvent, FetchOutcome, FetchRequest, FetchResponse, FetchTransport, Fetcher,
    HttpFetchTransport,
};
pub use installer::{
    parse_progress_line, CommandInstaller, InstallCoordinator, InstallSession, Installer,
    SeamlessProgress,
};
pub use manifest::{parse_manifest, ManifestCache, ManifestEntry};
pub use record::{PackageType, PersistentStatus, TransientStatus, UpdateRecord};
pub use scheduler::{BackoffPolicy, CheckScheduler, CheckTrigger};
pub use store::UpdateStore;
pub use verifier::{ChecksumAlgorithm, Verifier, VerifyOutcome};
