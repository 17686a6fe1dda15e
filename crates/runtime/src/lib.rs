pub mod context;
pub mod exec_bind;
pub mod identity;
pub mod indexer;
pub mod kernel;
pub mod ledger_tools;
pub mod markers;
pub mod ontology;
pub mod query_rewrite;
pub mod reflection;
pub mod retrieval;
pub mod runtime_loop;
pub mod supervisor;
pub mod web_search;

pub use kernel::{AutonomyKernel, KernelAction, KernelDecision};
pub use ontology::{OntologyAutonomy, OntologyInsight};
pub use retrieval::{run_retrieval_pipeline, RetrievalResult};
pub use runtime_loop::{RuntimeLoop, RuntimeOptions};
pub use supervisor::{AutonomySupervisor, Clock, FixedClock, SystemClock};
