/// Bytes per texel for every texture format the engine uses.
pub const TEXEL_SIZE: u32 = 4;

/// Edge length of the tiles the undo ledger snapshots.
pub const UNDO_TILE_SIZE: u32 = 64;

/// Ray-generation groups in a paint or view pipeline.
pub const RAYGEN_GROUP_COUNT: u32 = 1;

/// Miss groups: primary, then occlusion.
pub const MISS_GROUP_COUNT: u32 = 2;

/// Closest-hit groups.
pub const HIT_GROUP_COUNT: u32 = 1;

/// Miss index used for primary (camera or surface lookup) rays.
pub const MISS_PRIMARY: u32 = 0;

/// Miss index used for occlusion (shadow/visibility) rays.
pub const MISS_OCCLUSION: u32 = 1;

/// Size of the host arena holding uniform blocks and binding tables.
pub const HOST_ARENA_SIZE: u64 = 64 * 1024;

/// Albedo under unpainted texels.
pub const BASE_ALBEDO: [f32; 3] = [0.8, 0.8, 0.8];

/// Ambient term added to the Lambert factor.
pub const AMBIENT_LIGHT: f32 = 0.1;

/// Default clear color of the offscreen target.
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.12, 1.0];
