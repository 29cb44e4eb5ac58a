use std::path::Path;

use async_trait::async_trait;
use nusgrab_fetch::CancelToken;
use nusgrab_io::Device;
use nusgrab_tmd::TitleMetadata;

/// Hands a downloaded title folder to the platform installer.
///
/// The installer is a console service on real hardware; the trait keeps
/// the queue testable and lets embedders wrap whatever backend exists.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the title laid out under `source` onto `target`.
    ///
    /// Returns the installer's numeric result code; zero is success.
    /// Implementations should honor `cancel` between internal steps.
    async fn install(
        &self,
        metadata: &TitleMetadata,
        source: &Path,
        target: Device,
        cancel: &CancelToken,
    ) -> i32;
}
