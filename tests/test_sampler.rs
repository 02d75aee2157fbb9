//! Tests for dataset partitions and minibatch sampling
//!
//! This file tests:
//! - Record counts derived from label buffers
//! - Random batches: size, one-hot targets, label bounds
//! - Sequential batches: clamping at the end of the test partition

use approx::assert_relative_eq;
use sequential_trainer::dataset::{Dataset, DatasetLayout, DatasetSampler};
use sequential_trainer::{EngineError, ImageShape};

fn layout() -> DatasetLayout {
    DatasetLayout {
        image_size: 3,
        image_metadata_size: 16,
        label_metadata_size: 8,
    }
}

/// Image/label buffers where every pixel of record `i` equals `i`.
fn split(labels: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut images = vec![0u8; 16];
    for i in 0..labels.len() {
        images.extend(std::iter::repeat(i as u8).take(9));
    }
    let mut label_bytes = vec![0u8; 8];
    label_bytes.extend_from_slice(labels);
    (images, label_bytes)
}

fn dataset(train: &[u8], test: &[u8]) -> Dataset {
    let (train_images, train_labels) = split(train);
    let (test_images, test_labels) = split(test);
    Dataset::new(train_images, train_labels, test_images, test_labels, layout()).unwrap()
}

// ============================================================================
// Partition Tests
// ============================================================================

mod partition_tests {
    use super::*;

    #[test]
    fn test_counts_and_shape() {
        let ds = dataset(&[0, 1, 2, 3], &[4, 5]);
        assert_eq!(ds.train().len(), 4);
        assert_eq!(ds.test().len(), 2);
        assert_eq!(ds.image_shape(), ImageShape::new(3, 3, 1));
    }

    #[test]
    fn test_pixels_normalized() {
        let mut images = vec![0u8; 16];
        images.extend([0, 255, 51, 0, 0, 0, 0, 0, 255]);
        let mut labels = vec![0u8; 8];
        labels.push(1);
        let ds = Dataset::new(images.clone(), labels.clone(), images, labels, layout()).unwrap();

        let image = ds.train().image(0).unwrap();
        assert_eq!(image.shape(), ImageShape::new(3, 3, 1));
        assert_relative_eq!(image.data()[1], 1.0);
        assert_relative_eq!(image.data()[2], 0.2, epsilon = 1e-6);
        assert_relative_eq!(image.data()[8], 1.0);
    }

    #[test]
    fn test_extra_image_bytes_accepted() {
        let (mut images, labels) = split(&[0, 1]);
        images.extend([9u8; 5]);
        assert!(Dataset::new(images.clone(), labels.clone(), images, labels, layout()).is_ok());
    }

    #[test]
    fn test_short_image_buffer_rejected() {
        let (mut images, labels) = split(&[0, 1, 2]);
        images.truncate(images.len() - 1);
        let (ti, tl) = split(&[0]);
        let err = Dataset::new(images, labels, ti, tl, layout()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}

// ============================================================================
// Random Batch Tests
// ============================================================================

mod random_batch_tests {
    use super::*;

    #[test]
    fn test_batch_has_n_one_hot_pairs() {
        let ds = dataset(&[0, 1, 2, 1, 0, 2, 2, 1], &[0]);
        let mut sampler = DatasetSampler::new(3, 17);
        let batch = sampler.sample_random_batch(&ds, 40).unwrap();

        assert_eq!(batch.len(), 40);
        for (target, &label) in batch.targets().iter().zip(batch.labels()) {
            assert_eq!(target.len(), 3);
            assert_eq!(target.iter().filter(|&&v| v == 1.0).count(), 1);
            assert_eq!(target.iter().filter(|&&v| v == 0.0).count(), 2);
            assert_eq!(target[label as usize], 1.0);
        }
    }

    #[test]
    fn test_image_matches_label() {
        // Label of record i is i, and so is every pixel.
        let labels: Vec<u8> = (0..5).collect();
        let ds = dataset(&labels, &[0]);
        let mut sampler = DatasetSampler::new(5, 3);
        let batch = sampler.sample_random_batch(&ds, 20).unwrap();

        for (image, &label) in batch.images().iter().zip(batch.labels()) {
            let expected = label as f32 / 255.0;
            assert!(image.data().iter().all(|&v| (v - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let ds = dataset(&[0, 1, 2, 0, 1, 2], &[0]);
        let mut a = DatasetSampler::new(3, 99);
        let mut b = DatasetSampler::new(3, 99);
        for _ in 0..3 {
            let left = a.sample_random_batch(&ds, 6).unwrap();
            let right = b.sample_random_batch(&ds, 6).unwrap();
            assert_eq!(left.labels(), right.labels());
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let ds = dataset(&[0], &[0]);
        let mut sampler = DatasetSampler::new(3, 1);
        assert!(sampler.sample_random_batch(&ds, 0).is_err());
    }

    #[test]
    fn test_empty_training_partition_rejected() {
        let ds = dataset(&[], &[0]);
        let mut sampler = DatasetSampler::new(3, 1);
        assert!(sampler.sample_random_batch(&ds, 4).is_err());
    }

    #[test]
    fn test_label_beyond_class_count() {
        let ds = dataset(&[5, 5], &[0]);
        let mut sampler = DatasetSampler::new(3, 1);
        assert!(matches!(
            sampler.sample_random_batch(&ds, 1),
            Err(EngineError::DataBounds(_))
        ));
    }
}

// ============================================================================
// Sequential Batch Tests
// ============================================================================

mod sequential_batch_tests {
    use super::*;

    #[test]
    fn test_batches_cover_test_set_in_order() {
        let ds = dataset(&[0], &[0, 1, 2, 0, 1, 2, 0]);
        let mut sampler = DatasetSampler::new(3, 1);

        let first = sampler.sequential_batch(&ds, 0, 4).unwrap();
        assert_eq!(first.labels(), &[0, 1, 2, 0]);
        assert_eq!(sampler.cursor(), 4);

        let rest = sampler.next_sequential_batch(&ds, 4).unwrap();
        assert_eq!(rest.labels(), &[1, 2, 0]);
        assert_eq!(sampler.cursor(), 7);
    }

    #[test]
    fn test_start_at_end_is_empty() {
        let ds = dataset(&[0], &[0, 1]);
        let mut sampler = DatasetSampler::new(3, 1);
        assert!(sampler.sequential_batch(&ds, 2, 5).unwrap().is_empty());
    }

    #[test]
    fn test_start_past_end_rejected() {
        let ds = dataset(&[0], &[0, 1]);
        let mut sampler = DatasetSampler::new(3, 1);
        assert!(matches!(
            sampler.sequential_batch(&ds, 3, 1),
            Err(EngineError::DataBounds(_))
        ));
    }

    #[test]
    fn test_reset_cursor() {
        let ds = dataset(&[0], &[2, 1]);
        let mut sampler = DatasetSampler::new(3, 1);
        sampler.next_sequential_batch(&ds, 2).unwrap();
        sampler.reset_cursor();
        assert_eq!(sampler.next_sequential_batch(&ds, 1).unwrap().labels(), &[2]);
    }
}
