//! Omron EtherNet/IP 标签桥接：结构体布局编译、drvInfo 描述符解析、读请求合并与轮询。

pub mod comm;
