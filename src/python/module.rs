//! Python module definition.

use pyo3::prelude::*;

use super::{logging, streams};

#[pymodule]
fn _medfeed(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_tracing();

    m.add_class::<streams::PyVolumeStream>()?;
    m.add_class::<streams::PyPairedStream>()?;
    m.add_class::<streams::PyPriorCoupler>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    Ok(())
}
