use actix_web::{HttpResponse, get, web};

use crate::ws::handler;
use crate::ws::server::RelayServerHandle;

#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    hub: web::Data<RelayServerHandle>,
) -> Result<HttpResponse, actix_web::Error> {
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    actix_web::rt::spawn(handler::handle_ws((**hub).clone(), session, msg_stream));

    Ok(res)
}
