use nalgebra::{DMatrix, DVector, DVectorView, Scalar};
use thiserror::Error as ThisError;

/// An error structure that contains error variants that occur when declaring
/// which parameter positions are shared across a batch.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum LayoutError {
    /// The same parameter position was listed twice in the global subset.
    #[error("Parameter position {} appears more than once in the global subset.", position)]
    DuplicatePosition {
        /// the duplicated position
        position: usize,
    },

    /// A position in the global subset does not exist in the parameter vector.
    #[error(
        "Parameter position {} is out of bounds for a parameter vector of length {}.",
        position,
        len
    )]
    PositionOutOfBounds {
        /// the out of bounds position
        position: usize,
        /// the length of the parameter vector
        len: usize,
    },
}

/// The partition of parameter vector positions into a global subset, shared
/// by every transient of a batch, and its local complement, fitted
/// individually per transient.
///
/// A typical use is sharing the lifetimes $\tau_i$ across all pixels of an
/// image while the amplitudes $A_i$ and the offset $Z$ stay local. For the
/// single-exponential layout $(Z, A_1, \tau_1)$ that partition is declared as
///
/// ```rust
/// # use flimfit::mapping::GlobalLayout;
/// let layout = GlobalLayout::with_global(3, &[2]).unwrap();
/// assert_eq!(layout.global_positions(), &[2]);
/// assert_eq!(layout.local_positions(), &[0, 1]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalLayout {
    n_params: usize,
    global: Vec<usize>,
    local: Vec<usize>,
}

impl GlobalLayout {
    /// a layout where every parameter is fitted per transient
    pub fn all_local(n_params: usize) -> Self {
        Self {
            n_params,
            global: Vec::new(),
            local: (0..n_params).collect(),
        }
    }

    /// a layout where every parameter is shared across the batch
    pub fn all_global(n_params: usize) -> Self {
        Self {
            n_params,
            global: (0..n_params).collect(),
            local: Vec::new(),
        }
    }

    /// Declare the given parameter positions as global, leaving the rest
    /// local. The positions may be given in any order.
    ///
    /// # Errors
    ///
    /// Fails if a position occurs twice or lies outside the parameter vector.
    pub fn with_global(n_params: usize, global_positions: &[usize]) -> Result<Self, LayoutError> {
        let mut is_global = vec![false; n_params];
        for &position in global_positions {
            if position >= n_params {
                return Err(LayoutError::PositionOutOfBounds {
                    position,
                    len: n_params,
                });
            }
            if is_global[position] {
                return Err(LayoutError::DuplicatePosition { position });
            }
            is_global[position] = true;
        }
        let global = (0..n_params).filter(|&p| is_global[p]).collect();
        let local = (0..n_params).filter(|&p| !is_global[p]).collect();
        Ok(Self {
            n_params,
            global,
            local,
        })
    }

    /// the length of the per-transient parameter vector this layout describes
    pub fn parameter_count(&self) -> usize {
        self.n_params
    }

    /// the globally shared parameter positions in ascending order
    pub fn global_positions(&self) -> &[usize] {
        &self.global
    }

    /// the per-transient parameter positions in ascending order
    pub fn local_positions(&self) -> &[usize] {
        &self.local
    }

    /// whether the parameter at this position is shared across the batch
    pub fn is_global(&self, position: usize) -> bool {
        self.global.binary_search(&position).is_ok()
    }
}

/// The index tables that translate between the per-transient parameter
/// vectors and the reduced vector that the solver actually optimizes.
///
/// For a batch of $T$ transients the reduced vector concatenates the free
/// global parameters followed by the free local parameters of each transient
/// in turn:
///
/// ```math
/// \vec{q} = (g_1,\dots,g_{n_g},\;
///            l^{(0)}_1,\dots,l^{(0)}_{n_l},\;
///            \dots,\;
///            l^{(T-1)}_1,\dots,l^{(T-1)}_{n_l}),
/// ```
///
/// where $n_g$ and $n_l$ count the free global and free local positions.
/// Fixed positions do not appear in the reduced vector at all; their values
/// are taken from the initial guess of each transient when a full parameter
/// vector is reconstructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalParameterMapper {
    n_trans: usize,
    n_params: usize,
    free_global: Vec<usize>,
    free_local: Vec<usize>,
}

impl GlobalParameterMapper {
    /// Build the index tables for a batch of `n_trans` transients from the
    /// layout and the free mask. Masked-out (fixed) positions are excluded
    /// from the reduced space no matter whether they are global or local.
    ///
    /// # Panics
    ///
    /// Panics if the free mask length differs from the layout's parameter
    /// count.
    pub fn new(layout: &GlobalLayout, free_mask: &[bool], n_trans: usize) -> Self {
        assert_eq!(
            layout.parameter_count(),
            free_mask.len(),
            "Free mask must have one entry per model parameter."
        );
        let free_global = layout
            .global_positions()
            .iter()
            .copied()
            .filter(|&p| free_mask[p])
            .collect();
        let free_local = layout
            .local_positions()
            .iter()
            .copied()
            .filter(|&p| free_mask[p])
            .collect();
        Self {
            n_trans,
            n_params: layout.parameter_count(),
            free_global,
            free_local,
        }
    }

    /// the number of transients this mapper was built for
    pub fn n_trans(&self) -> usize {
        self.n_trans
    }

    /// the number of free globally shared parameters
    pub fn free_global_count(&self) -> usize {
        self.free_global.len()
    }

    /// the number of free local parameters per transient
    pub fn free_local_count(&self) -> usize {
        self.free_local.len()
    }

    /// the total length of the reduced parameter vector
    pub fn reduced_len(&self) -> usize {
        self.free_global.len() + self.n_trans * self.free_local.len()
    }

    /// the number of jacobian columns each transient contributes, which is
    /// the number of its free parameters (global and local)
    pub fn curve_free_count(&self) -> usize {
        self.free_global.len() + self.free_local.len()
    }

    /// The free parameter positions of one transient in the column order of
    /// its jacobian block: free globals first, free locals second, each in
    /// ascending position order.
    pub fn free_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.free_global
            .iter()
            .chain(self.free_local.iter())
            .copied()
    }

    /// The reduced vector indices that the jacobian columns of the transient
    /// in the given batch slot scatter into, in the same order as
    /// [`free_positions`](GlobalParameterMapper::free_positions).
    pub fn reduced_columns(&self, slot: usize) -> Vec<usize> {
        let n_free_global = self.free_global.len();
        let base = n_free_global + slot * self.free_local.len();
        (0..n_free_global)
            .chain((0..self.free_local.len()).map(|j| base + j))
            .collect()
    }

    /// the full parameter vector position that the given reduced vector
    /// index belongs to
    pub fn full_position(&self, reduced_index: usize) -> usize {
        let n_free_global = self.free_global.len();
        if reduced_index < n_free_global {
            self.free_global[reduced_index]
        } else {
            self.free_local[(reduced_index - n_free_global) % self.free_local.len()]
        }
    }

    /// Gather the initial reduced vector from the per-transient initial
    /// guesses. `columns` lists the guess matrix column for each batch slot;
    /// global positions are seeded from the first listed column.
    ///
    /// # Panics
    ///
    /// Panics if `columns` does not have one entry per batch slot.
    pub fn reduce_initial<ScalarType: Scalar + Copy>(
        &self,
        initial_guesses: &DMatrix<ScalarType>,
        columns: &[usize],
    ) -> DVector<ScalarType> {
        assert_eq!(
            columns.len(),
            self.n_trans,
            "Need one initial guess column per batch slot."
        );
        let globals = self
            .free_global
            .iter()
            .map(|&position| initial_guesses[(position, columns[0])]);
        let locals = columns.iter().flat_map(|&column| {
            self.free_local
                .iter()
                .map(move |&position| initial_guesses[(position, column)])
        });
        DVector::from_iterator(self.reduced_len(), globals.chain(locals))
    }

    /// Scatter the reduced vector back into the full parameter vector of the
    /// transient in the given batch slot. Fixed positions keep the values of
    /// the provided template, which is typically the transient's initial
    /// guess.
    pub fn expand_for_slot<ScalarType: Scalar + Copy>(
        &self,
        reduced: &DVector<ScalarType>,
        template: DVectorView<'_, ScalarType>,
        slot: usize,
    ) -> DVector<ScalarType> {
        let mut full = template.clone_owned();
        for (k, &position) in self.free_global.iter().enumerate() {
            full[position] = reduced[k];
        }
        let base = self.free_global.len() + slot * self.free_local.len();
        for (j, &position) in self.free_local.iter().enumerate() {
            full[position] = reduced[base + j];
        }
        full
    }
}
