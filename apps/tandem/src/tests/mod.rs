mod reconnect;
mod relay_room;
