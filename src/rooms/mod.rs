//! Rooms, membership snapshots and capacity limits

mod types;

pub use types::{
    clamp_capacity, format_capacity_label, mic_room, normalize_display_name, parse_capacity,
    pretty_room_name, CapacityMap, RoomSnapshot, DEFAULT_CAPACITY, LOBBY, MAX_CAPACITY,
    MAX_NAME_LENGTH, MIC_ROOMS, MIN_CAPACITY,
};
