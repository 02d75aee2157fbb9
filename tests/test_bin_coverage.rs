use std::io::Write;
use tempfile::NamedTempFile;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

#[allow(dead_code)]
mod mnist_sequential_bin {
    include!("../mnist_sequential.rs");

    #[cfg(test)]
    mod coverage_tests {
        use super::*;
        use sequential_trainer::tensor::ImageShape;

        #[test]
        fn test_config_from_args_without_path() {
            let args = vec!["mnist_sequential".to_string()];
            let config = config_from_args(&args).unwrap();
            assert_eq!(config.batch_size, 40);
            assert_eq!(config.class_count, 10);
        }

        #[test]
        fn test_config_from_args_with_path() {
            let temp = crate::write_temp_config(r#"{ "iterations": 12, "batch_size": 16 }"#);
            let args = vec![
                "mnist_sequential".to_string(),
                temp.path().to_str().unwrap().to_string(),
            ];
            let config = config_from_args(&args).unwrap();
            assert_eq!(config.iterations, 12);
            assert_eq!(config.batch_size, 16);
        }

        #[test]
        fn test_config_from_args_missing_file() {
            let args = vec![
                "mnist_sequential".to_string(),
                "config/missing.json".to_string(),
            ];
            assert!(config_from_args(&args).is_err());
        }

        #[test]
        fn test_classifier_compiles_for_mnist() {
            let mut model = Sequential::with_layers(
                ImageShape::new(28, 28, 1),
                TrainingConfig::default(),
                classifier(10),
            )
            .unwrap();
            model
                .compile(OptimizerKind::Adam, LossSpec::mse(Reduction::Mean))
                .unwrap();

            assert_eq!(model.node_output_shape("Pool1"), Some(ImageShape::new(POOL_OUT, POOL_OUT, CONV_OUT)));
            assert_eq!(model.output_shape().unwrap(), ImageShape::vector(10));
        }

        #[test]
        fn test_missing_data_reports_error() {
            if std::path::Path::new("./data/train-images.idx3-ubyte").exists() {
                return;
            }
            assert!(load_mnist().is_err());
        }
    }
}
