// 该文件是 Fenjian （分拣） 项目的一部分。
// src/server.rs - HTTP 服务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::Arc;

use axum::{
  Json, Router,
  body::Bytes,
  extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
  model::Model,
  service::{DetectError, DetectResponse, DetectService},
  storage::PUBLIC_PREFIX,
};

/// 上传表单中承载图像的字段名
pub const UPLOAD_FIELD: &str = "file";

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

impl IntoResponse for DetectError {
  fn into_response(self) -> Response {
    let status = if self.is_client_error() {
      warn!("拒绝上传: {:?}", self);
      StatusCode::BAD_REQUEST
    } else {
      error!("处理失败: {}", self);
      StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = ErrorBody {
      error: self.to_string(),
    };
    (status, Json(body)).into_response()
  }
}

/// 构建路由：`POST /detect/`、`GET /images/*`、`GET /health`
///
/// CORS 对所有来源、方法与请求头开放。
pub fn router<M: Model + 'static>(service: Arc<DetectService<M>>, max_upload_bytes: usize) -> Router {
  let images = ServeDir::new(service.store().root());

  Router::new()
    .route("/detect/", post(detect::<M>))
    .route("/detect", post(detect::<M>))
    .route("/health", get(health))
    .nest_service(PUBLIC_PREFIX, images)
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(CorsLayer::very_permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(service)
}

/// 启动服务，收到 Ctrl-C 后平滑退出
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
  info!("服务监听地址: {}", listener.local_addr()?);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => error!("无法监听中断信号: {}", e),
  }
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

async fn detect<M: Model + 'static>(
  State(service): State<Arc<DetectService<M>>>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>, DetectError> {
  let multipart = multipart.map_err(|e| DetectError::Upload(e.body_text()))?;
  let (filename, bytes) = read_upload(multipart).await?;
  info!("收到上传: {} ({} 字节)", filename, bytes.len());

  // 推理是 CPU 密集操作，放到阻塞线程池中执行
  let response = tokio::task::spawn_blocking(move || service.detect(&bytes, &filename))
    .await
    .map_err(|e| DetectError::Join(e.to_string()))??;

  Ok(Json(response))
}

/// 取出 `file` 字段的文件名与内容，其余字段忽略
async fn read_upload(mut multipart: Multipart) -> Result<(String, Bytes), DetectError> {
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| DetectError::Upload(e.body_text()))?
  {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }
    let filename = field
      .file_name()
      .map(str::to_owned)
      .ok_or(DetectError::MissingFile)?;
    let bytes = field
      .bytes()
      .await
      .map_err(|e| DetectError::Upload(e.body_text()))?;
    return Ok((filename, bytes));
  }
  Err(DetectError::MissingFile)
}
