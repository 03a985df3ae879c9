pub mod add_trackers_to_magnet_uri;
pub mod duration;
pub mod get_user_agent;
pub mod parse_magnet_uri;
pub mod should_ignore_path;
