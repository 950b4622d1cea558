//! Matrix representations and the conversion between them.
//!
//! [`Matrix`] is a tagged variant: a caller fills whichever form it has, and
//! backends ask for the form they need. Turning a legacy matrix into a
//! distributed one is the slow path; it works, but always logs a warning.

pub mod distributed;
pub mod legacy;

use std::borrow::Cow;

pub use distributed::{Csr, DistributedMatrix};
pub use legacy::LegacyMatrix;

use crate::algs::communicator::Communicator;
use crate::mesh_error::MeshSolveError;
use crate::topology::partition::CellPartition;

/// Storage form of a [`Matrix`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatrixForm {
    Legacy,
    Distributed,
}

#[derive(Clone, Debug)]
pub enum Matrix {
    Legacy(LegacyMatrix),
    Distributed(DistributedMatrix),
}

impl From<LegacyMatrix> for Matrix {
    fn from(m: LegacyMatrix) -> Self {
        Matrix::Legacy(m)
    }
}

impl From<DistributedMatrix> for Matrix {
    fn from(m: DistributedMatrix) -> Self {
        Matrix::Distributed(m)
    }
}

impl Matrix {
    /// Empty per-process legacy matrix over the overlapping cells of `partition`.
    pub fn legacy(partition: &CellPartition) -> Self {
        Matrix::Legacy(LegacyMatrix::new(partition.overlapping_count()))
    }

    /// Empty distributed matrix over `partition`.
    pub fn distributed(partition: &CellPartition) -> Self {
        Matrix::Distributed(DistributedMatrix::new(partition))
    }

    pub fn form(&self) -> MatrixForm {
        match self {
            Matrix::Legacy(_) => MatrixForm::Legacy,
            Matrix::Distributed(_) => MatrixForm::Distributed,
        }
    }

    /// Overwrite `(row, col)`; indices are in the form's own numbering.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        match self {
            Matrix::Legacy(m) => m.set(row, col, value),
            Matrix::Distributed(m) => m.set(row, col, value),
        }
    }

    /// Accumulate into `(row, col)`; indices are in the form's own numbering.
    pub fn add_to(&mut self, row: usize, col: usize, value: f64) -> Result<(), MeshSolveError> {
        match self {
            Matrix::Legacy(m) => m.add_to(row, col, value),
            Matrix::Distributed(m) => m.add_to(row, col, value),
        }
    }

    /// Make the matrix ready for solving. Collective for the distributed form.
    pub fn finalize<C: Communicator>(&mut self, comm: &C) -> Result<(), MeshSolveError> {
        match self {
            Matrix::Legacy(m) => {
                m.finalize();
                Ok(())
            }
            Matrix::Distributed(m) => m.finalize(comm),
        }
    }

    pub fn is_finalized(&self) -> bool {
        match self {
            Matrix::Legacy(m) => m.is_finalized(),
            Matrix::Distributed(m) => m.is_finalized(),
        }
    }

    /// Distributed view of the matrix, converting a legacy matrix if needed.
    ///
    /// The flag is `true` when the slow conversion ran. A per-process legacy
    /// matrix is refused when more than one rank is active; a replicated one
    /// contributes only this rank's rows. Every rank must call this together.
    pub fn as_distributed<C: Communicator>(
        &self,
        partition: &CellPartition,
        comm: &C,
    ) -> Result<(Cow<'_, DistributedMatrix>, bool), MeshSolveError> {
        if !self.is_finalized() {
            return Err(MeshSolveError::MatrixNotFinalized);
        }
        let legacy = match self {
            Matrix::Distributed(m) => return Ok((Cow::Borrowed(m), false)),
            Matrix::Legacy(m) => m,
        };
        if comm.size() > 1 && !legacy.is_replicated() {
            return Err(MeshSolveError::LegacyConversionInParallel { ranks: comm.size() });
        }
        log::warn!(
            "rank {}: converting a {}x{} legacy matrix to distributed form; \
             assemble into a distributed matrix to avoid this copy",
            comm.rank(),
            legacy.dimension(),
            legacy.dimension()
        );

        let mut dist = DistributedMatrix::new(partition);
        if legacy.is_replicated() {
            check_dimension(legacy.dimension(), partition.global_count() as usize)?;
            let range = partition.layout().local_range();
            for (r, c, v) in legacy.triplets() {
                if range.contains(&(r as u64)) {
                    dist.set_global(r as u64, c as u64, v)?;
                }
            }
        } else {
            check_dimension(legacy.dimension(), partition.overlapping_count())?;
            let globals = partition.overlapping_global_ids();
            dist.insert_global(legacy.triplets().map(|(r, c, v)| (globals[r], globals[c], v)))?;
        }
        dist.compact();
        Ok((Cow::Owned(dist), true))
    }

    /// Whole global system on this rank, in non-overlapping numbering.
    ///
    /// Collective when the matrix is distributed.
    pub fn as_replicated_legacy<C: Communicator>(
        &self,
        partition: &CellPartition,
        comm: &C,
    ) -> Result<Cow<'_, LegacyMatrix>, MeshSolveError> {
        if !self.is_finalized() {
            return Err(MeshSolveError::MatrixNotFinalized);
        }
        match self {
            Matrix::Distributed(m) => Ok(Cow::Owned(m.to_legacy(comm)?)),
            Matrix::Legacy(m) if m.is_replicated() => {
                check_dimension(m.dimension(), partition.global_count() as usize)?;
                Ok(Cow::Borrowed(m))
            }
            Matrix::Legacy(_) if comm.size() > 1 => {
                Err(MeshSolveError::LegacyConversionInParallel { ranks: comm.size() })
            }
            Matrix::Legacy(m) => {
                check_dimension(m.dimension(), partition.overlapping_count())?;
                Ok(Cow::Owned(m.relabelled(partition.overlapping_global_ids(), true)?))
            }
        }
    }
}

fn check_dimension(got: usize, expected: usize) -> Result<(), MeshSolveError> {
    if got == expected {
        Ok(())
    } else {
        Err(MeshSolveError::LengthMismatch {
            what: "matrix dimension",
            expected,
            got,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn chain(p: &CellPartition, form: MatrixForm) -> Matrix {
        let mut m = match form {
            MatrixForm::Legacy => Matrix::legacy(p),
            MatrixForm::Distributed => Matrix::distributed(p),
        };
        let n = p.overlapping_count();
        for i in 0..n {
            m.add_to(i, i, 2.0).unwrap();
            if i + 1 < n {
                m.add_to(i, i + 1, -1.0).unwrap();
                m.add_to(i + 1, i, -1.0).unwrap();
            }
        }
        m.finalize(&NoComm).unwrap();
        m
    }

    #[test]
    fn distributed_input_is_borrowed() {
        let p = CellPartition::serial(3);
        let m = chain(&p, MatrixForm::Distributed);
        let (d, converted) = m.as_distributed(&p, &NoComm).unwrap();
        assert!(!converted);
        assert!(matches!(d, Cow::Borrowed(_)));
    }

    #[test]
    fn serial_legacy_converts_through_global_numbering() {
        let p = CellPartition::build(vec![9, 4], vec![0, 0], &NoComm).unwrap();
        let mut m = Matrix::legacy(&p);
        m.set(0, 0, 5.0).unwrap();
        m.set(0, 1, 1.0).unwrap();
        m.finalize(&NoComm).unwrap();
        let (d, converted) = m.as_distributed(&p, &NoComm).unwrap();
        assert!(converted);
        assert!(d.is_finalized());
        // cell 9 is global 1, cell 4 is global 0
        assert_eq!(d.get_global(1, 1), Some(5.0));
        assert_eq!(d.get_global(1, 0), Some(1.0));
    }

    #[test]
    fn unfinalized_matrix_is_refused() {
        let p = CellPartition::serial(1);
        let mut m = Matrix::distributed(&p);
        m.add_to(0, 0, 1.0).unwrap();
        assert!(matches!(
            m.as_distributed(&p, &NoComm),
            Err(MeshSolveError::MatrixNotFinalized)
        ));
        assert!(matches!(
            m.as_replicated_legacy(&p, &NoComm),
            Err(MeshSolveError::MatrixNotFinalized)
        ));
    }

    #[test]
    fn legacy_and_distributed_agree_after_round_trip() {
        let p = CellPartition::serial(4);
        let legacy = chain(&p, MatrixForm::Legacy);
        let (d, _) = legacy.as_distributed(&p, &NoComm).unwrap();
        let back = d.to_legacy(&NoComm).unwrap();
        let Matrix::Legacy(orig) = &legacy else { unreachable!() };
        assert_eq!(back.to_dense(), orig.to_dense());
    }

    static WARNINGS: parking_lot::Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

    struct CaptureWarnings;

    impl log::Log for CaptureWarnings {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                WARNINGS.lock().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: CaptureWarnings = CaptureWarnings;

    fn warnings_mentioning(needle: &str) -> usize {
        WARNINGS.lock().iter().filter(|w| w.contains(needle)).count()
    }

    #[test]
    fn legacy_conversion_is_logged_as_a_warning() {
        // fails harmlessly if a logger is already installed
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Warn);

        let p = CellPartition::serial(7);
        let legacy = chain(&p, MatrixForm::Legacy);
        legacy.as_distributed(&p, &NoComm).unwrap();
        assert_eq!(warnings_mentioning("7x7 legacy matrix"), 1);

        let q = CellPartition::serial(11);
        let dist = chain(&q, MatrixForm::Distributed);
        dist.as_distributed(&q, &NoComm).unwrap();
        assert_eq!(warnings_mentioning("11x11"), 0);
    }

    #[test]
    fn wrong_dimension_is_a_configuration_error() {
        let p = CellPartition::serial(2);
        let mut m = Matrix::Legacy(LegacyMatrix::new(3));
        m.finalize(&NoComm).unwrap();
        let err = m.as_distributed(&p, &NoComm).unwrap_err();
        assert!(err.is_configuration());
    }
}
