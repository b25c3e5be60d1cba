//! Kubernetes and Helm integration.
//!
//! All interaction with registered clusters goes through the [`KubeDriver`]
//! trait, which wraps the `kubectl` and `helm` binaries. Every call receives
//! the path of a materialized kubeconfig and a pre-tokenized argument list;
//! nothing is ever passed through a shell. Consumers parse the captured
//! stdout with the column helpers in [`crate::utils`].
//!
//! The default driver, [`process::ProcessKubeDriver`], spawns the binaries as
//! subprocesses. Keeping the seam at the trait lets tests substitute a
//! scripted driver.

mod base;
pub mod process;

pub use base::*;
