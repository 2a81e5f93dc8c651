//! The container harness (C11): materialises a self-contained working tree
//! for a job and either hands it to a container runtime or, when no image
//! is configured, runs it in the host process group. Grounded in
//! `original_source/hither2`'s container runner (`_run_function_in_container`
//! and `ConsoleCapture`): the `###### RUNNING: <label>` marker line, the
//! `NUM_WORKERS`/`MKL_NUM_THREADS`/`NUMEXPR_NUM_THREADS`/`OMP_NUM_THREADS`
//! environment propagation, and the `USE_SINGULARITY`/`DEBUG_KEEP_TEMP`
//! switches all come from there.

use std::path::Path;
use std::process::Command;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use jobrelay_base::error::JobError;
use jobrelay_base::job::RuntimeInfo;
use jobrelay_base::proto::CodeBundle;
use jobrelay_util::fs::Fs;

/// The in-host-process-group fallback used when a job has no container
/// image: re-invoke the named function directly against post-codec plain
/// data. A real container path would shell out to the same function
/// through a re-exec of the compute binary; the signature here matches C11
/// exactly so both paths produce the same `HarnessResult`.
pub trait HostRunner: Send + Sync {
    fn run(&self, function_name: &str, kwargs: &serde_json::Value) -> Result<serde_json::Value, JobError>;
}

pub struct HarnessInput<'a> {
    pub code_bundle: &'a CodeBundle,
    pub function_name: &'a str,
    pub serialized_kwargs: &'a serde_json::Value,
    pub image: Option<&'a str>,
    pub no_resolve_input_files: bool,
    pub label: Option<&'a str>,
    pub timeout: Option<f64>,
}

pub struct HarnessResult {
    pub success: bool,
    pub retval: Option<serde_json::Value>,
    pub runtime_info: RuntimeInfo,
    pub error: Option<JobError>,
}

const NUM_WORKERS_ENV: &[&str] = &["NUM_WORKERS", "MKL_NUM_THREADS", "NUMEXPR_NUM_THREADS", "OMP_NUM_THREADS"];

pub fn run_harness(input: HarnessInput, host_runner: &dyn HostRunner) -> Result<HarnessResult> {
    let fs = Fs::new();
    let temp = tempfile::tempdir().context("creating harness temp tree")?;
    materialize_bundle(&fs, temp.path(), input.code_bundle)?;
    fs.write(
        temp.path().join("kwargs.json"),
        serde_json::to_vec_pretty(input.serialized_kwargs)?,
    )?;
    let run_script = temp.path().join("run.sh");
    fs.write(&run_script, render_run_script(input.function_name).as_bytes())?;

    let marker = format!("###### RUNNING: {}", input.label.unwrap_or(input.function_name));

    let result = if let Some(image) = input.image {
        run_in_container(image, temp.path(), &marker, input.timeout)
    } else {
        run_in_host_process(host_runner, input.function_name, input.serialized_kwargs, &marker, input.timeout)
    };

    if std::env::var("DEBUG_KEEP_TEMP").is_ok() {
        let _ = temp.into_path();
    }

    result
}

fn render_run_script(function_name: &str) -> String {
    format!(
        "#!/bin/sh\nexec jobrelay-worker run-function --name {function_name} --kwargs kwargs.json\n"
    )
}

fn materialize_bundle(fs: &Fs, root: &Path, bundle: &CodeBundle) -> Result<()> {
    for file in &bundle.files {
        fs.write(root.join(&file.name), file.content.as_bytes())?;
    }
    for dir in &bundle.dirs {
        let sub = root.join(&dir.name);
        fs.create_dir_all(&sub)?;
        materialize_bundle(fs, &sub, &dir.content)?;
    }
    Ok(())
}

fn run_in_host_process(
    host_runner: &dyn HostRunner,
    function_name: &str,
    kwargs: &serde_json::Value,
    marker: &str,
    timeout: Option<f64>,
) -> Result<HarnessResult> {
    let start = now_secs();
    // `thread::scope` lets the worker borrow `host_runner`/`kwargs` for its
    // lifetime instead of requiring `'static` + cloning, while still giving
    // the outer call a timeout via `recv_timeout`.
    let (timed_out, outcome) = std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        scope.spawn(move || {
            let outcome = host_runner.run(function_name, kwargs);
            let _ = tx.send(outcome);
        });
        match timeout {
            Some(secs) => match rx.recv_timeout(Duration::from_secs_f64(secs)) {
                Ok(outcome) => (false, outcome),
                Err(_) => (true, Err(JobError::timed_out(secs))),
            },
            None => (
                false,
                rx.recv()
                    .unwrap_or_else(|_| Err(JobError::framework("worker thread dropped without a result"))),
            ),
        }
    });
    let end = now_secs();

    let runtime_info = RuntimeInfo {
        start_time: Some(start),
        end_time: Some(end),
        stdout: format!("{marker}\n"),
        stderr: String::new(),
        console_out: format!("{marker}\n"),
        timed_out,
    };

    Ok(match outcome {
        Ok(retval) => HarnessResult {
            success: true,
            retval: Some(retval),
            runtime_info,
            error: None,
        },
        Err(error) => HarnessResult {
            success: false,
            retval: None,
            runtime_info,
            error: Some(error),
        },
    })
}

fn run_in_container(image: &str, work_dir: &Path, marker: &str, timeout: Option<f64>) -> Result<HarnessResult> {
    let blob_dir = std::env::var("BLOB_STORAGE_DIR")
        .map_err(|_| anyhow!("BLOB_STORAGE_DIR must be set before container execution"))?;
    let runtime = if std::env::var("USE_SINGULARITY").is_ok() { "singularity" } else { "docker" };

    let mut cmd = Command::new(runtime);
    cmd.arg("run")
        .arg("--rm")
        .arg("-v")
        .arg(format!("{}:/working:rw", work_dir.display()))
        .arg("-v")
        .arg(format!("{blob_dir}:/blobs:ro"))
        .arg("-w")
        .arg("/working");
    for var in NUM_WORKERS_ENV {
        if let Ok(value) = std::env::var(var) {
            cmd.arg("-e").arg(format!("{var}={value}"));
        }
    }
    cmd.arg(image).arg("sh").arg("run.sh");

    let start = now_secs();
    println!("{marker}");
    let mut child = cmd.spawn().context("spawning container runtime")?;

    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                timed_out = true;
                break child.wait()?;
            }
        }
        std::thread::sleep(Duration::from_millis(25));
    };
    let end = now_secs();

    let result_path = work_dir.join("result.json");
    let runtime_info_base = RuntimeInfo {
        start_time: Some(start),
        end_time: Some(end),
        stdout: format!("{marker}\n"),
        stderr: String::new(),
        console_out: format!("{marker}\n"),
        timed_out,
    };

    if timed_out {
        return Ok(HarnessResult {
            success: false,
            retval: None,
            runtime_info: runtime_info_base,
            error: Some(JobError::timed_out(timeout.unwrap_or_default())),
        });
    }

    if !result_path.exists() {
        if status.success() {
            return Err(anyhow!("container exited 0 without writing result.json"));
        }
        return Ok(HarnessResult {
            success: false,
            retval: None,
            runtime_info: runtime_info_base,
            error: Some(JobError::framework(format!(
                "container exited with {status} and no result.json"
            ))),
        });
    }

    let raw = std::fs::read(&result_path).context("reading result.json")?;
    let doc: jobrelay_base::proto::ResultDocument =
        serde_json::from_slice(&raw).context("parsing result.json")?;

    Ok(HarnessResult {
        success: doc.success,
        retval: doc.retval,
        runtime_info: doc.runtime_info,
        error: doc.error,
    })
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_base::proto::{CodeDir, CodeFile};

    struct EchoRunner;
    impl HostRunner for EchoRunner {
        fn run(&self, _name: &str, kwargs: &serde_json::Value) -> Result<serde_json::Value, JobError> {
            Ok(kwargs.clone())
        }
    }

    #[test]
    fn no_image_runs_in_host_process_and_echoes_the_marker() {
        let bundle = CodeBundle {
            files: vec![CodeFile {
                name: "FUNCTION.txt".into(),
                content: "sqr@0.1.0".into(),
            }],
            dirs: vec![CodeDir {
                name: "_local_modules".into(),
                content: CodeBundle::default(),
            }],
        };
        let input = HarnessInput {
            code_bundle: &bundle,
            function_name: "sqr",
            serialized_kwargs: &serde_json::json!({"x": 5}),
            image: None,
            no_resolve_input_files: false,
            label: Some("sqr"),
            timeout: None,
        };
        let runner = EchoRunner;
        let result = run_harness(input, &runner).unwrap();
        assert!(result.success);
        assert_eq!(result.retval, Some(serde_json::json!({"x": 5})));
        assert!(result.runtime_info.stdout.contains("###### RUNNING: sqr"));
    }

    #[test]
    fn timeout_marks_timed_out_without_a_container() {
        struct SlowRunner;
        impl HostRunner for SlowRunner {
            fn run(&self, _name: &str, _kwargs: &serde_json::Value) -> Result<serde_json::Value, JobError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(serde_json::json!(null))
            }
        }
        let bundle = CodeBundle::default();
        let input = HarnessInput {
            code_bundle: &bundle,
            function_name: "slow",
            serialized_kwargs: &serde_json::json!({}),
            image: None,
            no_resolve_input_files: false,
            label: None,
            timeout: Some(0.01),
        };
        let result = run_harness(input, &SlowRunner).unwrap();
        assert!(!result.success);
        assert!(result.runtime_info.timed_out);
    }
}
