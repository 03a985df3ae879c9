/// `User-Agent` sent on every outbound provider request, so a provider's
/// support team can tell this client apart from a browser or curl.
pub fn get_user_agent() -> String {
    format!("debridvault/{}", env!("CARGO_PKG_VERSION"))
}
