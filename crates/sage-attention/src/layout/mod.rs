//! Input normalization: validation, head-dim padding and host views.

pub mod normalize;
pub mod view;

pub use normalize::{pad_head_dim, padded_head_dim, trim_head_dim, validate_inputs, MAX_HEAD_DIM};
pub use view::HostView;
