// 该文件是 Fenjian （分拣） 项目的一部分。
// src/main.rs - 检测服务主程序
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

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fenjian::{
  args::ServeArgs,
  config::Config,
  model::Yolov8Builder,
  server,
  service::DetectService,
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = ServeArgs::parse();
  let mut config = Config::load(&args.common)?;
  if let Some(listen) = args.listen {
    config.server.listen = listen;
  }

  info!("模型地址: {}", config.model.url);
  info!("图像目录: {}", config.storage.images_dir.display());
  info!("置信度阈值: {}", config.model.confidence);

  let model = Yolov8Builder::from_settings(&config.model)?.build()?;

  let service = Arc::new(DetectService::from_config(model, &config)?);
  let app = server::router(service, config.server.max_upload_bytes);

  let listener = TcpListener::bind(config.server.listen).await?;
  server::serve(listener, app).await?;

  info!("服务已退出");
  Ok(())
}
