#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod render;
mod utils;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use console::style;
use crossbeam_channel::RecvTimeoutError;
use glob::glob;
use indicatif::ProgressBar;

pub use crate::error::{BatchError, DotbatchError, JobFailure};
use crate::render::Job;

/// How long one batch run waits for its outstanding jobs. When the ceiling
/// elapses the wait is abandoned; jobs still in flight keep running on the
/// pool threads.
const WAIT_BATCH: Duration = Duration::from_secs(600);

/// Renders Graphviz `.dot` files from an input directory into `.png` images
/// in an output directory.
///
/// Every file is rendered independently by the external renderer program on
/// a worker pool sized to the host's available parallelism. A file whose
/// artifacts already exist on disk is skipped entirely, which makes repeated
/// runs cheap.
///
/// ```rust,no_run
/// use dotbatch::DotRenderer;
///
/// # fn main() -> Result<(), dotbatch::DotbatchError> {
/// let renderer = DotRenderer::new("graphs", "dist", false);
/// let files = renderer.find_dot_files()?;
/// renderer.render_all(&files)?;
/// # Ok(())
/// # }
/// ```
pub struct DotRenderer {
    pub(crate) input_dir: Utf8PathBuf,
    pub(crate) output_dir: Utf8PathBuf,
    pub(crate) simple: bool,
    pub(crate) program: String,
}

impl DotRenderer {
    /// Creates a renderer over `input_dir` which writes images to
    /// `output_dir`. With `simple` enabled only the image artifact is
    /// produced; otherwise every render also emits a client-side image map
    /// next to its source file.
    pub fn new(
        input_dir: impl Into<Utf8PathBuf>,
        output_dir: impl Into<Utf8PathBuf>,
        simple: bool,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            simple,
            program: String::from("dot"),
        }
    }

    /// Overrides the renderer program invoked for each file, `dot` by default.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Lists the files in the input directory whose name ends with `.dot`,
    /// in lexicographic order. Subdirectories are not searched.
    pub fn find_dot_files(&self) -> Result<Vec<Utf8PathBuf>, DotbatchError> {
        let pattern = self.input_dir.join("*.dot");

        let mut files = Vec::new();
        for entry in glob(pattern.as_str())? {
            let path = Utf8PathBuf::try_from(entry?)?;
            if path.is_file() {
                files.push(path);
            }
        }

        Ok(files)
    }

    /// Renders every given file, skipping the ones whose artifacts already
    /// exist.
    ///
    /// Jobs run concurrently with no ordering guarantee, and a failed job
    /// never aborts its siblings. When one or more jobs failed, the returned
    /// [`BatchError`] enumerates every collected failure.
    pub fn render_all(&self, files: &[Utf8PathBuf]) -> Result<(), DotbatchError> {
        crate::utils::init_logging();

        let s = Instant::now();

        eprintln!(
            "Rendering {} graph(s) with {}.",
            files.len(),
            style(&self.program).blue()
        );

        let pool = rayon::ThreadPoolBuilder::new().build()?;
        let (tx, rx) = crossbeam_channel::unbounded();

        let bar =
            ProgressBar::new(files.len() as u64).with_style(crate::utils::PROGRESS_STYLE.clone());
        let active = Arc::new(Mutex::new(HashSet::new()));

        let mut failures = Vec::new();
        let mut pending = 0usize;

        for file in files {
            let job = match Job::new(self, file) {
                Ok(job) => job,
                Err(error) => {
                    failures.push(JobFailure {
                        file: file.clone(),
                        error,
                    });
                    bar.inc(1);
                    continue;
                }
            };

            let tx = tx.clone();
            let bar = bar.clone();
            let active = Arc::clone(&active);
            pending += 1;

            pool.spawn(move || {
                {
                    let mut active = active.lock().unwrap();
                    active.insert(job.source.clone());
                    bar.set_message(format_active(&active));
                }

                let result = job.run();

                {
                    let mut active = active.lock().unwrap();
                    active.remove(&job.source);
                    bar.set_message(format_active(&active));
                    bar.inc(1);
                }

                tx.send((job, result)).ok();
            });
        }

        drop(tx);

        let deadline = Instant::now() + WAIT_BATCH;
        let mut done = 0;

        while done < pending {
            match rx.recv_deadline(deadline) {
                Ok((_job, Ok(_))) => done += 1,
                Ok((job, Err(error))) => {
                    done += 1;
                    failures.push(JobFailure {
                        file: job.source,
                        error,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        "Gave up waiting for {} outstanding render job(s) after {}s",
                        pending - done,
                        WAIT_BATCH.as_secs()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        bar.finish_with_message(format!("Rendered graphs {}", crate::utils::as_overhead(s)));

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BatchError(failures).into())
        }
    }
}

fn format_active(active: &HashSet<Utf8PathBuf>) -> String {
    const MAX: usize = 5;
    let mut names: Vec<_> = active
        .iter()
        .map(|path| path.file_name().unwrap_or(path.as_str()))
        .collect();
    names.sort_unstable();

    if names.len() <= MAX {
        names.join(", ")
    } else {
        format!("{}… ({} total)", names[..MAX].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    #[cfg(unix)]
    use camino::Utf8Path;

    use super::*;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[cfg(unix)]
    fn fake_renderer(dir: &Utf8Path, script: &str) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-dot.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Stands in for `dot`: writes every `-o` artifact, but refuses files
    /// whose name starts with `bad`.
    #[cfg(unix)]
    const RENDER_UNLESS_BAD: &str = concat!(
        "#!/bin/sh\n",
        "case \"$1\" in\n",
        "    bad*) exit 1 ;;\n",
        "esac\n",
        "for arg in \"$@\"; do\n",
        "    case \"$arg\" in\n",
        "        -o*) printf 'artifact' > \"${arg#-o}\" ;;\n",
        "    esac\n",
        "done\n",
    );

    #[test]
    fn discovery_finds_only_dot_files() {
        let (_guard, dir) = tempdir();
        fs::write(dir.join("b.dot"), "digraph {}").unwrap();
        fs::write(dir.join("a.dot"), "digraph {}").unwrap();
        fs::write(dir.join("notes.txt"), "").unwrap();
        fs::write(dir.join("c.dot.bak"), "").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("d.dot"), "digraph {}").unwrap();

        let renderer = DotRenderer::new(dir.clone(), dir.clone(), true);
        let files = renderer.find_dot_files().unwrap();

        let names: Vec<_> = files.iter().filter_map(|file| file.file_name()).collect();
        assert_eq!(names, ["a.dot", "b.dot"]);
    }

    #[test]
    fn format_active_caps_the_listing() {
        let active: HashSet<Utf8PathBuf> = ["b.dot", "a.dot"]
            .iter()
            .map(|name| Utf8PathBuf::from(*name))
            .collect();
        assert_eq!(format_active(&active), "a.dot, b.dot");

        let active: HashSet<Utf8PathBuf> = (0..7)
            .map(|i| Utf8PathBuf::from(format!("g{i}.dot")))
            .collect();
        assert!(format_active(&active).ends_with("(7 total)"));
    }

    #[cfg(unix)]
    #[test]
    fn render_all_creates_images() {
        let (_guard, dir) = tempdir();
        let out = dir.join("out");
        fs::create_dir(&out).unwrap();
        let program = fake_renderer(&dir, RENDER_UNLESS_BAD);

        for name in ["x.dot", "y.dot", "z.dot"] {
            fs::write(dir.join(name), "digraph {}").unwrap();
        }

        let renderer = DotRenderer::new(dir.clone(), out.clone(), false).program(program);
        let files = renderer.find_dot_files().unwrap();
        renderer.render_all(&files).unwrap();

        for name in ["x.png", "y.png", "z.png"] {
            assert!(out.join(name).is_file());
        }
        assert!(dir.join("x.map").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn render_all_reports_every_failure() {
        let (_guard, dir) = tempdir();
        let out = dir.join("out");
        fs::create_dir(&out).unwrap();
        let program = fake_renderer(&dir, RENDER_UNLESS_BAD);

        for name in ["good0.dot", "good1.dot", "bad0.dot", "bad1.dot"] {
            fs::write(dir.join(name), "digraph {}").unwrap();
        }

        let renderer = DotRenderer::new(dir.clone(), out, true).program(program);
        let files = renderer.find_dot_files().unwrap();

        let DotbatchError::Batch(batch) = renderer.render_all(&files).unwrap_err() else {
            panic!("expected an aggregate failure");
        };

        assert_eq!(batch.0.len(), 2);
        let message = batch.to_string();
        assert!(message.contains("bad0.dot"));
        assert!(message.contains("bad1.dot"));
        assert!(!message.contains("good0.dot"));
    }

    #[cfg(unix)]
    #[test]
    fn second_run_skips_every_job() {
        let (_guard, dir) = tempdir();
        let out = dir.join("out");
        fs::create_dir(&out).unwrap();

        let log = dir.join("calls.log");
        let script = format!(
            concat!(
                "#!/bin/sh\n",
                "echo \"$1\" >> {log}\n",
                "for arg in \"$@\"; do\n",
                "    case \"$arg\" in\n",
                "        -o*) printf 'artifact' > \"${{arg#-o}}\" ;;\n",
                "    esac\n",
                "done\n",
            ),
            log = log
        );
        let program = fake_renderer(&dir, &script);

        for name in ["x.dot", "y.dot", "z.dot"] {
            fs::write(dir.join(name), "digraph {}").unwrap();
        }

        let renderer = DotRenderer::new(dir.clone(), out, false).program(program);
        let files = renderer.find_dot_files().unwrap();

        renderer.render_all(&files).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 3);

        renderer.render_all(&files).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn render_all_collects_failures_under_load() {
        let (_guard, dir) = tempdir();
        let out = dir.join("out");
        fs::create_dir(&out).unwrap();
        let program = fake_renderer(&dir, RENDER_UNLESS_BAD);

        for i in 0..25 {
            fs::write(dir.join(format!("good{i:02}.dot")), "digraph {}").unwrap();
            fs::write(dir.join(format!("bad{i:02}.dot")), "digraph {}").unwrap();
        }

        let renderer = DotRenderer::new(dir.clone(), out, true).program(program);
        let files = renderer.find_dot_files().unwrap();
        assert_eq!(files.len(), 50);

        let DotbatchError::Batch(batch) = renderer.render_all(&files).unwrap_err() else {
            panic!("expected an aggregate failure");
        };

        assert_eq!(batch.0.len(), 25);
        for i in 0..25 {
            let name = format!("bad{i:02}.dot");
            assert!(batch.0.iter().any(|failure| failure.file.as_str().contains(&name)));
        }
    }
}
