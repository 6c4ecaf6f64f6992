use crate::model::{Category, Product};
use crate::supervisor::Supervisor;
use bytes::Bytes;
use catalogmq_client::Producer;
use catalogmq_codec::Codec;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, error};
use std::convert::Infallible;
use std::sync::Arc;

/// Producer and codec of one entity type.
pub(crate) struct Endpoint<E> {
    pub(crate) producer: Arc<Producer<E>>,
    pub(crate) codec: Arc<dyn Codec<E>>,
}

impl<E> Clone for Endpoint<E> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            codec: Arc::clone(&self.codec),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) products: Endpoint<Product>,
    pub(crate) categories: Endpoint<Category>,
    pub(crate) supervisor: Arc<Supervisor>,
}

pub(crate) async fn route<B>(req: Request<B>, context: Context) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    debug!("{} {}", req.method(), req.uri().path());

    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/api/products") => create(req, &context.products, "product").await,
        (&Method::POST, "/api/categories") => create(req, &context.categories, "category").await,
        (&Method::GET, "/api/consumers") => consumers(&context.supervisor),
        _ => text(StatusCode::NOT_FOUND, "Not found".to_owned()),
    };

    Ok(response)
}

/// Decode the entity from the request body, send it to its queue and echo it back.
async fn create<E, B>(req: Request<B>, endpoint: &Endpoint<E>, kind: &str) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("Cannot read request body: {e}")),
    };

    let entity = match std::str::from_utf8(&body)
        .map_err(|e| e.to_string())
        .and_then(|s| endpoint.codec.decode(s).map_err(|e| e.to_string()))
    {
        Ok(entity) => entity,
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("Invalid {kind}: {e}")),
    };

    if let Err(e) = endpoint.producer.send(&entity).await {
        error!("Cannot send {} to queue {}: {}", kind, endpoint.producer.queue_name(), e);

        return text(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to process {kind}"));
    }

    match endpoint.codec.encode(&entity) {
        Ok(echo) => with_content_type(StatusCode::CREATED, echo, endpoint.codec.content_type()),
        Err(e) => {
            error!("Cannot encode {} for the response: {}", kind, e);

            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to process {kind}"))
        }
    }
}

fn consumers(supervisor: &Supervisor) -> Response<Full<Bytes>> {
    match serde_json::to_string(&supervisor.statuses()) {
        Ok(body) => with_content_type(StatusCode::OK, body, "application/json"),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    with_content_type(status, body, "text/plain; charset=utf-8")
}

fn with_content_type(status: StatusCode, body: String, content_type: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));

    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    response
}
