use std::future::Future;

use crate::http::request::Request;
use crate::http::response::Response;

/// Application entry point for a received request.
///
/// A handler prepares either a body (`add_body`) or a file (`set_file`) and
/// calls [`Response::end`]. A handler that returns without sending is
/// answered with a 500 by the connection.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        req: Request,
        res: &mut Response,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Greets every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welcome;

impl Handler for Welcome {
    async fn handle(&self, _req: Request, res: &mut Response) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "code": 200,
            "success": "Welcome to Quay",
        });
        res.add_body(body.to_string())?;
        res.end().await?;
        Ok(())
    }
}
