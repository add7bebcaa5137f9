use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::queue::GradingQueue;
use crate::routes::{configure, json_error_handler};

pub fn build_server(server_config: ServerConfig, queue: Arc<GradingQueue>) -> std::io::Result<Server> {
    let queue = web::Data::from(queue);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(queue.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
