//! Static assets with SPA fallback
//!
//! Files under the static root are served as-is; a directory serves its
//! `index.html`; anything else gets the index document with status 200 so the
//! client-side router can take over.

use tower_http::services::{ServeDir, ServeFile};
use tracing::warn;

use crate::config::RouterConfig;

pub type AssetService = ServeDir<ServeFile>;

pub fn service(config: &RouterConfig) -> AssetService {
    let index = config.index_path();
    if !index.is_file() {
        warn!(
            index = %index.display(),
            "Index document missing, unmatched paths will return 404"
        );
    }

    ServeDir::new(&config.static_root)
        .append_index_html_on_directories(true)
        .fallback(ServeFile::new(index))
}
