//! RHI-specific error types.
//!
//! The variants follow how far a failure reaches:
//! - [`RhiError::SubmissionFailed`] and [`RhiError::SurfaceInvalidated`] cost
//!   one frame; the frame is skipped and rendering continues.
//! - [`RhiError::ResourceExhausted`] is returned to the caller, who decides
//!   whether to shrink the workload or abort.
//! - [`RhiError::DeviceLost`] invalidates every pooled and in-flight resource;
//!   the owning application has to tear the subsystem down.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error without a more specific classification
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// The device could not create further handles
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The queue rejected a submission; the submitted buffer is discarded
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// The device stopped responding or was reset
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// The presentation surface is out of date or lost and must be recreated
    #[error("Surface invalidated: {0}")]
    SurfaceInvalidated(String),

    /// Swapchain creation error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// An operation was called in a state where it cannot make progress
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A construction parameter was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RhiError {
    /// Returns true for errors that cost a single frame and should be
    /// handled by skipping it.
    pub fn is_frame_transient(&self) -> bool {
        matches!(
            self,
            RhiError::SubmissionFailed(_) | RhiError::SurfaceInvalidated(_)
        )
    }

    /// Returns true if the device is gone and the subsystem must be rebuilt.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RhiError::DeviceLost(_))
    }

    /// Reclassifies a queue-submission failure.
    ///
    /// Device loss keeps its severity; everything else becomes
    /// [`RhiError::SubmissionFailed`].
    pub(crate) fn into_submission_failure(self) -> Self {
        match self {
            RhiError::DeviceLost(_) | RhiError::SubmissionFailed(_) => self,
            other => RhiError::SubmissionFailed(other.to_string()),
        }
    }
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost(format!("{result:?}")),
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => {
                RhiError::ResourceExhausted(format!("{result:?}"))
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                RhiError::SurfaceInvalidated(format!("{result:?}"))
            }
            other => RhiError::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_classified() {
        let err = RhiError::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(err.is_device_lost());
        assert!(!err.is_frame_transient());
    }

    #[test]
    fn test_out_of_memory_is_resource_exhaustion() {
        for result in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_TOO_MANY_OBJECTS,
        ] {
            assert!(matches!(
                RhiError::from(result),
                RhiError::ResourceExhausted(_)
            ));
        }
    }

    #[test]
    fn test_out_of_date_surface_is_frame_transient() {
        let err = RhiError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, RhiError::SurfaceInvalidated(_)));
        assert!(err.is_frame_transient());
    }

    #[test]
    fn test_unclassified_result_is_kept() {
        let err = RhiError::from(vk::Result::ERROR_INITIALIZATION_FAILED);
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn test_submission_failure_keeps_device_loss() {
        let lost = RhiError::DeviceLost("gone".to_string()).into_submission_failure();
        assert!(lost.is_device_lost());

        let rejected = RhiError::from(vk::Result::ERROR_UNKNOWN).into_submission_failure();
        assert!(matches!(rejected, RhiError::SubmissionFailed(_)));
    }
}
