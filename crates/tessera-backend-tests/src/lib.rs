pub mod graphs;
pub mod mock_backend;
pub mod smoke;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub use mock_backend::{ExecutionRecorder, MockBackend, MockBackendBuilder, MockCompiledSubgraph};

/// Installs a test log subscriber once per process. Filtered through `RUST_LOG`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Instantiates the backend-neutral smoke suite.
///
/// `$setup` is a closure returning `(Arc<BackendRegistry>, BackendId)` for the backend
/// under test.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $setup:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::smoke;

            fn setup() -> (
                ::std::sync::Arc<::tessera::backend::BackendRegistry>,
                ::tessera::backend::BackendId,
            ) {
                $crate::init_test_logging();
                ($setup)()
            }

            #[test]
            fn smoke_activation_relu_matches_expected() {
                let (registry, backend) = setup();
                smoke::activation_relu_matches_expected(&registry, &backend);
            }

            #[test]
            fn smoke_concat_of_computed_inputs_matches_expected() {
                let (registry, backend) = setup();
                smoke::concat_of_computed_inputs_matches_expected(&registry, &backend);
            }

            #[test]
            fn smoke_quantized_concat_requantizes_inputs() {
                let (registry, backend) = setup();
                smoke::quantized_concat_requantizes_inputs(&registry, &backend);
            }

            #[test]
            fn smoke_split_then_add_matches_expected() {
                let (registry, backend) = setup();
                smoke::split_then_add_matches_expected(&registry, &backend);
            }

            #[test]
            fn smoke_inverse_permutes_are_transparent() {
                let (registry, backend) = setup();
                smoke::inverse_permutes_are_transparent(&registry, &backend);
            }

            #[test]
            fn smoke_nhwc_convolution_matches_expected() {
                let (registry, backend) = setup();
                smoke::nhwc_convolution_matches_expected(&registry, &backend);
            }

            #[test]
            fn smoke_fully_connected_matches_expected() {
                let (registry, backend) = setup();
                smoke::fully_connected_matches_expected(&registry, &backend);
            }

            #[test]
            fn smoke_repeated_enqueues_are_independent() {
                let (registry, backend) = setup();
                smoke::repeated_enqueues_are_independent(&registry, &backend);
            }
        }
    };
}
