mod capture;
mod helpers;
mod redirection;
mod spawn;
