pub mod container;
pub mod stl;
pub mod mesh;
pub mod stats;
pub mod keys;
pub mod facets;
pub mod store;
pub mod options;
pub mod batch;
pub mod decode;
pub mod convert;

pub use container::{read_container, parse_container, ContainerError, ContainerRecord};
pub use stl::{read_stl, parse_stl, StlError, TriangleSoup};
pub use mesh::{derive_precision, MeshSample, Vertex};
pub use keys::{recover_key, KeyHypothesis, KeyReport, Verdict};
pub use facets::{analyze_facets, decode_facets, FacetDecodeResult, FacetReport};
pub use store::{AnalysisRecord, BatchDatabase, CorrelationReport, StoreError};
pub use options::AnalysisOptions;
pub use batch::{run_batch, BatchError, PairPaths};
