// Hard limits enforced at the engine boundary.

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KIND_LEN: usize = 64;
pub const MAX_EQUIPMENT_ITEMS: usize = 64;
pub const MAX_MOTIF_LEN: usize = 1024;
pub const MAX_ACTOR_LEN: usize = 256;

/// Bookable calendar years. Anything outside is almost certainly a typo.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2199;
