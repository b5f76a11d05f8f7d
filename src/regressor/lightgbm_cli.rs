use super::gbdt::{BoostingConfig, GradientBoostingLearner};
use super::tree::TreeEnsemble;
use super::{validate_training_inputs, Learner, RegressorModel};
use crate::param_utils::{Params, SearchSpace};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use uuid::Uuid;

/// Delegates training to the LightGBM command-line program and reads the model text back.
#[derive(Debug, Clone)]
pub struct LightgbmCliLearner {
    executable: PathBuf,
}

impl LightgbmCliLearner {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    /// Uses the configured path when given, otherwise looks for `lightgbm` on PATH.
    pub fn resolve(configured: Option<PathBuf>) -> Result<Self> {
        let executable = resolve_lightgbm_executable(configured)?;
        info!("Using LightGBM executable at {}", executable.display());
        Ok(Self::new(executable))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl Learner for LightgbmCliLearner {
    fn name(&self) -> &'static str {
        "lightgbm_cli"
    }

    fn default_params(&self) -> Params {
        GradientBoostingLearner::new().default_params()
    }

    fn search_space(&self) -> SearchSpace {
        GradientBoostingLearner::new().search_space()
    }

    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        weights: &[f64],
        params: &Params,
        seed: u64,
    ) -> Result<RegressorModel> {
        let n_features = validate_training_inputs(x, y, weights)?;
        let run_id = Uuid::new_v4();
        let dataset_path = std::env::temp_dir().join(format!("price_engine_train_{run_id}.svm"));
        let model_path = std::env::temp_dir().join(format!("price_engine_model_{run_id}.txt"));

        write_libsvm_dataset(x, y, &dataset_path)?;
        let weight_path = write_dataset_weights(weights, &dataset_path)?;

        let mut args = training_args(&BoostingConfig::from_params(params), seed);
        args.push(format!("data={}", dataset_path.to_string_lossy()));
        args.push(format!("output_model={}", model_path.to_string_lossy()));
        debug!("Launching LightGBM with {}", args.join(" "));

        let status = Command::new(&self.executable)
            .args(&args)
            .stdout(Stdio::null())
            .status()
            .with_context(|| {
                format!(
                    "Failed to spawn {} for training",
                    self.executable.display()
                )
            });

        let model_text = match &status {
            Ok(exit) if exit.success() => fs::read_to_string(&model_path)
                .with_context(|| format!("Failed to read {}", model_path.display())),
            Ok(exit) => Err(anyhow!("LightGBM training failed with status {exit}")),
            Err(_) => Err(anyhow!("LightGBM training could not be started")),
        };

        for path in [&dataset_path, &weight_path, &model_path] {
            remove_scratch_file(path);
        }

        status?;
        let mut ensemble = TreeEnsemble::from_lightgbm_text(&model_text?)?;
        ensemble.n_features = ensemble.n_features.max(n_features);
        Ok(RegressorModel::Trees(ensemble))
    }
}

/// A file that is already gone is not a failure; the model file is never written when
/// training fails.
fn remove_scratch_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove scratch file {}: {err}", path.display());
        }
    }
}

/// Translates boosting parameters into LightGBM CLI arguments.
pub fn training_args(config: &BoostingConfig, seed: u64) -> Vec<String> {
    let num_leaves = 1usize << config.max_depth.min(16);
    let mut args = vec![
        String::from("task=train"),
        String::from("objective=regression"),
        String::from("boost_from_average=true"),
        format!("num_iterations={}", config.n_estimators),
        format!("learning_rate={}", config.learning_rate),
        format!("max_depth={}", config.max_depth),
        format!("num_leaves={}", num_leaves.max(2)),
        format!("min_sum_hessian_in_leaf={}", config.min_child_weight),
        String::from("min_data_in_leaf=1"),
        format!("min_gain_to_split={}", config.gamma),
        format!("lambda_l1={}", config.reg_alpha),
        format!("lambda_l2={}", config.reg_lambda),
        format!("feature_fraction={}", config.colsample_bytree),
        format!("seed={seed}"),
        String::from("deterministic=true"),
        String::from("num_threads=1"),
        String::from("verbosity=-1"),
    ];
    if config.subsample < 1.0 {
        args.push(format!("bagging_fraction={}", config.subsample));
        args.push(String::from("bagging_freq=1"));
    }
    args
}

pub fn write_libsvm_dataset(x: &[Vec<f64>], y: &[f64], path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );

    for (row, target) in x.iter().zip(y) {
        let mut line = format!("{}", target);
        for (idx, value) in row.iter().enumerate() {
            line.push(' ');
            line.push_str(&format!("{}:{:.10}", idx, value));
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_dataset_weights(weights: &[f64], dataset_path: &Path) -> Result<PathBuf> {
    let weight_path = dataset_weight_path(dataset_path);
    let mut writer = BufWriter::new(File::create(&weight_path)?);
    for weight in weights {
        writer.write_all(format!("{:.6}\n", weight).as_bytes())?;
    }
    writer.flush()?;
    Ok(weight_path)
}

fn dataset_weight_path(dataset_path: &Path) -> PathBuf {
    let mut os: OsString = dataset_path.as_os_str().to_os_string();
    os.push(".weight");
    PathBuf::from(os)
}

fn resolve_lightgbm_executable(configured: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path);
        }
        return Err(anyhow!(
            "LIGHTGBM_PATH points to {} which does not exist",
            path.display()
        ));
    }

    let binary = if cfg!(windows) { "lightgbm.exe" } else { "lightgbm" };
    if let Some(path) = find_in_path(binary) {
        return Ok(path);
    }

    Err(anyhow!(
        "lightgbm executable not found in PATH; install the LightGBM CLI or set TRAINER_BACKEND=native"
    ))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    for entry in std::env::split_paths(&path_value) {
        let candidate = entry.join(binary);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_utils::params_from_pairs;

    #[test]
    fn writes_libsvm_rows_and_weight_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset = dir.path().join("train.svm");
        write_libsvm_dataset(&[vec![1.0, 0.5], vec![2.0, -1.0]], &[3.0, 4.5], &dataset)
            .expect("write dataset");
        let weight_path = write_dataset_weights(&[1.0, 2.5], &dataset).expect("write weights");

        let text = fs::read_to_string(&dataset).expect("read dataset");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "3 0:1.0000000000 1:0.5000000000");
        assert_eq!(lines[1], "4.5 0:2.0000000000 1:-1.0000000000");
        assert_eq!(weight_path, dir.path().join("train.svm.weight"));
        assert_eq!(
            fs::read_to_string(&weight_path).expect("read weights"),
            "1.000000\n2.500000\n"
        );
    }

    #[test]
    fn scratch_cleanup_tolerates_missing_and_undeletable_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("model.txt");
        fs::write(&scratch, "tree").expect("write");
        remove_scratch_file(&scratch);
        assert!(!scratch.exists());
        remove_scratch_file(&scratch);

        // A directory cannot be removed as a file; the failure is logged, not raised.
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("mkdir");
        remove_scratch_file(&nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn maps_boosting_params_to_cli_arguments() {
        let params = params_from_pairs(&[("max_depth", 5.0), ("subsample", 0.7), ("gamma", 0.2)]);
        let args = training_args(&BoostingConfig::from_params(&params), 9);
        assert!(args.contains(&"objective=regression".to_string()));
        assert!(args.contains(&"num_leaves=32".to_string()));
        assert!(args.contains(&"bagging_fraction=0.7".to_string()));
        assert!(args.contains(&"min_gain_to_split=0.2".to_string()));
        assert!(args.contains(&"seed=9".to_string()));
    }

    #[test]
    fn missing_configured_executable_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here/lightgbm");
        assert!(LightgbmCliLearner::resolve(Some(missing)).is_err());
    }
}
