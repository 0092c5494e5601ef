//! Test suite for the training pipeline
//!
//! Unit tests live next to the code they cover. This module holds shared
//! fixtures and the end-to-end tests that drive a full session.


// Utility modules for testing
pub mod mock_data;
pub mod test_utils;

pub use mock_data::{create_mock_dataset, EmptyDataset, NanDataset, PartlyNanDataset};
pub use test_utils::{
    assert_record_valid, build_test_session, create_test_config, create_test_loaders,
    TEST_IMAGE_SHAPE,
};
