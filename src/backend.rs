//! Compile-time backend selection
//!
//! `ndarray` (CPU) is the default; building with `--features cuda` trains on
//! the GPU instead. The head is optimized on [`TrainingBackend`]; the frozen
//! backbone, validation and prediction run on [`InferenceBackend`].

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type InferenceBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type InferenceBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("Enable one backend feature: `ndarray` (default), `cpu` or `cuda`");

/// Backend used whenever no gradients are needed
pub type DefaultBackend = InferenceBackend;

/// Autodiff wrapper the classification head is trained on
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Device type shared by both backends
pub type Device = <InferenceBackend as Backend>::Device;

#[cfg(feature = "cuda")]
const BACKEND_NAME: &str = "CUDA (GPU)";

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
const BACKEND_NAME: &str = "NdArray (CPU)";

/// First device of the selected backend
pub fn default_device() -> Device {
    Device::default()
}

/// Human-readable name of the selected backend, for the run banner
pub fn backend_name() -> &'static str {
    BACKEND_NAME
}
